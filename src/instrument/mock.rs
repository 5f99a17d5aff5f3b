//! Simulated network analyzer.
//!
//! Answers the SCPI subset used by [`VnaSession`](super::vna::VnaSession):
//! setters are remembered per header and read back by `header?`, frequencies
//! and point counts are clamped to the simulated instrument's range, data
//! queries return a deterministic trace sized to the current point count and
//! `:SYST:ERR?` drains an injectable error queue.
//!
//! Clones share state.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::adapters::InstrumentTransport;
use crate::error::{AppResult, ChamberError};

const DEFAULT_START_HZ: f64 = 300.0e3;
const DEFAULT_STOP_HZ: f64 = 8.5e9;
const DEFAULT_POINTS: u32 = 201;

#[derive(Debug, Default)]
struct MockVnaState {
    settings: BTreeMap<String, String>,
    errors: VecDeque<(i32, String)>,
    error_triggers: Vec<(String, i32, String)>,
    fail_prefixes: Vec<String>,
    writes: Vec<String>,
    queries: Vec<String>,
    triggers: u32,
    closed: bool,
}

impl MockVnaState {
    fn check(&self, command: &str) -> AppResult<()> {
        if self.closed {
            return Err(ChamberError::Connection(
                "mock network analyzer is closed".to_string(),
            ));
        }
        if self.fail_prefixes.iter().any(|p| command.starts_with(p.as_str())) {
            return Err(ChamberError::timeout(
                format!("reply to {}", command),
                Duration::ZERO,
            ));
        }
        Ok(())
    }

    fn number(&self, header: &str, default: f64) -> f64 {
        self.settings
            .get(header)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn axis(&self, channel: &str) -> Vec<f64> {
        let start = self.number(&format!(":SENS{}:FREQ:STAR", channel), DEFAULT_START_HZ);
        let stop = self.number(&format!(":SENS{}:FREQ:STOP", channel), DEFAULT_STOP_HZ);
        let points = self.number(
            &format!(":SENS{}:SWE:POIN", channel),
            f64::from(DEFAULT_POINTS),
        ) as usize;

        match points {
            0 => Vec::new(),
            1 => vec![start],
            n => (0..n)
                .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
                .collect(),
        }
    }

    fn trace(&self, channel: &str) -> String {
        let scale = 1.0 / f64::from(self.triggers.max(1));
        self.axis(channel)
            .iter()
            .enumerate()
            .flat_map(|(k, _)| {
                let k = k as f64 + 1.0;
                [0.001 * k * scale, -0.002 * k * scale]
            })
            .map(|v| format!("{:E}", v))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn accept(&mut self, header: &str, value: &str) {
        let accepted = if header.ends_with(":FREQ:STAR") || header.ends_with(":FREQ:STOP") {
            clamp_number(value, MockVna::MIN_FREQUENCY_HZ, MockVna::MAX_FREQUENCY_HZ)
        } else if header.ends_with(":SWE:POIN") {
            clamp_number(value, 2.0, f64::from(MockVna::MAX_POINTS))
        } else {
            value.to_string()
        };
        self.settings.insert(header.to_string(), accepted);
    }

    fn write(&mut self, command: &str) {
        self.writes.push(command.to_string());
        let raised: Vec<(i32, String)> = self
            .error_triggers
            .iter()
            .filter(|(prefix, _, _)| command.starts_with(prefix.as_str()))
            .map(|(_, code, message)| (*code, message.clone()))
            .collect();
        self.errors.extend(raised);
        if command == ":TRIG:SING" {
            self.triggers += 1;
        }
        if let Some((header, value)) = command.split_once(' ') {
            self.accept(header, value.trim());
        }
    }

    fn query(&mut self, command: &str) -> String {
        self.queries.push(command.to_string());

        if command == "*OPC?" {
            return "1".to_string();
        }
        if command == ":SYST:ERR?" {
            return match self.errors.pop_front() {
                Some((code, message)) => format!("{:+},\"{}\"", code, message),
                None => "+0,\"No error\"".to_string(),
            };
        }
        if let Some(channel) = data_channel(command, ":DATA:XAX?") {
            return self
                .axis(channel)
                .iter()
                .map(|f| format!("{:E}", f))
                .collect::<Vec<_>>()
                .join(",");
        }
        if let Some(channel) =
            data_channel(command, ":DATA:SDAT?").or_else(|| data_channel(command, ":DATA:FDAT?"))
        {
            return self.trace(channel);
        }
        if command.starts_with(":SENS:DATA:RAWD?") {
            return self.trace("1");
        }

        let header = command.trim_end_matches('?');
        self.settings.get(header).cloned().unwrap_or_default()
    }
}

fn clamp_number(value: &str, min: f64, max: f64) -> String {
    match value.parse::<f64>() {
        Ok(v) => v.clamp(min, max).to_string(),
        Err(_) => value.to_string(),
    }
}

/// Channel digits of `:CALC{ch}{suffix}`.
fn data_channel<'a>(command: &'a str, suffix: &str) -> Option<&'a str> {
    command.strip_prefix(":CALC")?.strip_suffix(suffix)
}

/// Simulated network analyzer.
#[derive(Clone, Default)]
pub struct MockVna {
    state: Arc<Mutex<MockVnaState>>,
}

impl MockVna {
    pub const MIN_FREQUENCY_HZ: f64 = 300.0e3;
    pub const MAX_FREQUENCY_HZ: f64 = 8.5e9;
    pub const MAX_POINTS: u32 = 1601;

    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entry for `:SYST:ERR?`.
    pub async fn push_error(&self, code: i32, message: impl Into<String>) {
        self.state.lock().await.errors.push_back((code, message.into()));
    }

    /// Queue an error entry every time a command starting with `prefix` is written.
    pub async fn error_on(&self, prefix: impl Into<String>, code: i32, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .error_triggers
            .push((prefix.into(), code, message.into()));
    }

    /// Make every command starting with `prefix` fail with a timeout.
    pub async fn fail_on(&self, prefix: impl Into<String>) {
        self.state.lock().await.fail_prefixes.push(prefix.into());
    }

    /// Value last accepted for `header`.
    pub async fn setting(&self, header: &str) -> Option<String> {
        self.state.lock().await.settings.get(header).cloned()
    }

    pub async fn writes(&self) -> Vec<String> {
        self.state.lock().await.writes.clone()
    }

    pub async fn queries(&self) -> Vec<String> {
        self.state.lock().await.queries.clone()
    }

    pub async fn trigger_count(&self) -> u32 {
        self.state.lock().await.triggers
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl InstrumentTransport for MockVna {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.check(command)?;
        state.write(command);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        let mut state = self.state.lock().await;
        state.check(command)?;
        Ok(state.query(command))
    }

    async fn close(&mut self) -> AppResult<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }

    fn resource(&self) -> &str {
        "MOCK::VNA::INSTR"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_setting_readback() {
        let mut vna = MockVna::new();
        vna.write(":SENS1:SWE:TYPE LIN").await.unwrap();
        assert_eq!(vna.query(":SENS1:SWE:TYPE?").await.unwrap(), "LIN");
        assert_eq!(vna.query(":UNSET:HEADER?").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_frequency_clamped() {
        let mut vna = MockVna::new();
        vna.write(":SENS1:FREQ:STAR 10").await.unwrap();
        let start: f64 = vna.query(":SENS1:FREQ:STAR?").await.unwrap().parse().unwrap();
        assert_eq!(start, MockVna::MIN_FREQUENCY_HZ);
    }

    #[tokio::test]
    async fn test_axis_matches_points() {
        let mut vna = MockVna::new();
        vna.write(":SENS1:FREQ:STAR 1000000000").await.unwrap();
        vna.write(":SENS1:FREQ:STOP 3000000000").await.unwrap();
        vna.write(":SENS1:SWE:POIN 3").await.unwrap();
        let axis = vna.query(":CALC1:DATA:XAX?").await.unwrap();
        let values: Vec<f64> = axis.split(',').map(|v| v.parse().unwrap()).collect();
        assert_eq!(values, vec![1.0e9, 2.0e9, 3.0e9]);

        let data = vna.query(":CALC1:DATA:SDAT?").await.unwrap();
        assert_eq!(data.split(',').count(), 6);
    }

    #[tokio::test]
    async fn test_error_queue() {
        let mut vna = MockVna::new();
        vna.push_error(-113, "Undefined header").await;
        assert_eq!(
            vna.query(":SYST:ERR?").await.unwrap(),
            "-113,\"Undefined header\""
        );
        assert_eq!(vna.query(":SYST:ERR?").await.unwrap(), "+0,\"No error\"");
    }

    #[tokio::test]
    async fn test_error_raised_by_command() {
        let mut vna = MockVna::new();
        vna.error_on(":SENS1:FREQ:STOP", -222, "Data out of range").await;
        assert_eq!(vna.query(":SYST:ERR?").await.unwrap(), "+0,\"No error\"");
        vna.write(":SENS1:FREQ:STOP 20000000000").await.unwrap();
        assert_eq!(
            vna.query(":SYST:ERR?").await.unwrap(),
            "-222,\"Data out of range\""
        );
    }

    #[tokio::test]
    async fn test_fail_on_prefix() {
        let mut vna = MockVna::new();
        vna.fail_on("*OPC").await;
        let err = vna.query("*OPC?").await.unwrap_err();
        assert!(err.is_timeout());
        assert!(vna.write(":TRIG:SING").await.is_ok());
        assert_eq!(vna.trigger_count().await, 1);
    }
}
