//! Vector network analyzer session.
//!
//! A thin request/response layer over the SCPI subset the chamber uses. Every
//! setter writes the new value and then queries it back, returning the value
//! the instrument actually accepted. Analyzers snap frequencies and point counts
//! to their own grid, so callers must use the returned value downstream.
//!
//! ## Channel setup
//!
//! [`VnaSession::setup`] applies, in order: single-window display, active
//! channel, trace count, active trace, linear stepped sweep, RF output on, auto
//! sweep time, 1 kHz IF bandwidth, continuous initiation, bus trigger, polar
//! format, ASCII transfer, zero sweep delay and the state store type.
//!
//! ## Error queue
//!
//! [`VnaSession::get_errors`] drains `:SYST:ERR?` until the `0,"No error"`
//! sentinel and returns every `(code, message)` entry it collected.

use std::fmt;
use std::time::Duration;

use num_complex::Complex64;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapters::InstrumentTransport;
use crate::config::VnaConfig;
use crate::error::{AppResult, ChamberError};

/// Instrument state file used for calibration persistence.
pub const STATE_FILE: &str = "STAT03.STA";

/// Upper bound on error-queue reads in one drain.
const MAX_ERROR_QUEUE_DEPTH: usize = 100;

#[allow(clippy::expect_used)]
static ERROR_ENTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^,]+),([^,]+)").expect("error entry pattern is valid"));

/// One entry from the instrument error queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentFault {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for InstrumentFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error #{}: {}", self.code, self.message)
    }
}

/// Fixed pauses the instrument needs between operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VnaTiming {
    /// After `:TRIG:SING`, before polling `*OPC?`; also after loading state.
    pub settle: Duration,
    /// After storing state or starting an electronic calibration.
    pub save_state: Duration,
}

impl Default for VnaTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            save_state: Duration::from_secs(2),
        }
    }
}

impl VnaTiming {
    /// No pauses; for simulated instruments.
    pub const fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            save_state: Duration::ZERO,
        }
    }
}

impl From<&VnaConfig> for VnaTiming {
    fn from(config: &VnaConfig) -> Self {
        Self {
            settle: Duration::from_millis(config.settle_ms),
            save_state: Duration::from_millis(config.save_state_ms),
        }
    }
}

/// Single-owner session with the analyzer.
pub struct VnaSession {
    transport: Box<dyn InstrumentTransport>,
    timing: VnaTiming,
}

impl VnaSession {
    pub fn new(transport: Box<dyn InstrumentTransport>, timing: VnaTiming) -> Self {
        Self { transport, timing }
    }

    /// Open the configured resource, or discover the first one on the configured bus.
    pub async fn connect(config: &VnaConfig) -> AppResult<Self> {
        use crate::adapters::VisaAdapter;

        let adapter = match &config.resource {
            Some(resource) => {
                let mut adapter = VisaAdapter::new(resource.clone()).with_timeout(config.timeout());
                adapter.open().await?;
                adapter
            }
            None => {
                info!("Searching for {} devices", config.bus);
                VisaAdapter::discover(&config.bus, config.timeout()).await?
            }
        };
        info!(resource = adapter.resource(), "Connected to network analyzer");
        Ok(Self::new(Box::new(adapter), VnaTiming::from(config)))
    }

    pub fn resource(&self) -> &str {
        self.transport.resource()
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.transport.write(command).await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.transport.query(command).await
    }

    /// Write `header value`, then read back `header?`.
    async fn set(&mut self, header: &str, value: &str) -> AppResult<String> {
        self.write(&format!("{} {}", header, value)).await?;
        self.query(&format!("{}?", header)).await
    }

    async fn set_number(&mut self, header: &str, value: &str) -> AppResult<f64> {
        let reply = self.set(header, value).await?;
        parse_number(header, &reply)
    }

    /// Configure `channel`/`trace` for a stepped, bus-triggered sweep.
    ///
    /// The error queue is drained once the measurement format is set; the
    /// entries found are returned for the caller to judge.
    pub async fn setup(&mut self, channel: u8, trace: u8) -> AppResult<Vec<InstrumentFault>> {
        self.write(":DISP:SPL D1").await?;
        info!("setting channel");
        self.write(&format!(":DISP:WIND{}:ACT", channel)).await?;
        self.set(&format!(":CALC{}:PAR:COUN", channel), &trace.to_string())
            .await?;
        self.write(&format!(":CALC{}:PAR{}:SEL", channel, trace))
            .await?;
        self.set(&format!(":SENS{}:SWE:TYPE", channel), "LIN").await?;
        self.set(&format!(":SENS{}:SWE:GEN", channel), "STEP").await?;
        self.toggle_output(true).await?;
        self.set(&format!(":SENS{}:SWE:TIME:AUTO", channel), "ON")
            .await?;
        self.set(&format!(":SENS{}:BAND", channel), "1000").await?;
        self.set(&format!(":INIT{}:CONT", channel), "ON").await?;
        self.set(":TRIG:SOUR", "BUS").await?;
        info!("setting measurement format");
        self.set_measurement_format(channel).await?;
        let faults = self.get_errors().await?;
        self.set(":FORM:DATA", "ASC").await?;
        self.set(&format!(":SENS{}:SWE:DEL", channel), "0").await?;
        self.write(":MMEM:STOR:SALL OFF").await?;
        self.set(":MMEM:STOR:STYP", "CDST").await?;
        Ok(faults)
    }

    async fn toggle_output(&mut self, on: bool) -> AppResult<String> {
        self.set(":OUTP", on_off(on)).await
    }

    async fn set_measurement_format(&mut self, channel: u8) -> AppResult<String> {
        self.set(&format!(":CALC{}:FORM", channel), "POL").await
    }

    /// Returns the accepted start frequency in Hz.
    pub async fn set_start(&mut self, channel: u8, hz: f64) -> AppResult<f64> {
        self.set_number(&format!(":SENS{}:FREQ:STAR", channel), &hz.to_string())
            .await
    }

    /// Returns the accepted stop frequency in Hz.
    pub async fn set_stop(&mut self, channel: u8, hz: f64) -> AppResult<f64> {
        self.set_number(&format!(":SENS{}:FREQ:STOP", channel), &hz.to_string())
            .await
    }

    /// Returns the accepted center frequency in Hz.
    pub async fn set_center(&mut self, channel: u8, hz: f64) -> AppResult<f64> {
        self.set_number(&format!(":SENS{}:FREQ:CENT", channel), &hz.to_string())
            .await
    }

    /// Returns the accepted span in Hz.
    pub async fn set_span(&mut self, channel: u8, hz: f64) -> AppResult<f64> {
        self.set_number(&format!(":SENS{}:FREQ:SPAN", channel), &hz.to_string())
            .await
    }

    /// Returns the accepted number of sweep points.
    pub async fn set_points(&mut self, channel: u8, points: u32) -> AppResult<u32> {
        let header = format!(":SENS{}:SWE:POIN", channel);
        let accepted = self.set_number(&header, &points.to_string()).await?;
        if accepted < 0.0 || accepted > f64::from(u32::MAX) {
            return Err(ChamberError::unexpected(header, accepted.to_string()));
        }
        Ok(accepted.round() as u32)
    }

    /// Select `S{a}{b}` for the trace; returns the parameter now measured.
    pub async fn set_measurement(&mut self, channel: u8, trace: u8, a: u8, b: u8) -> AppResult<String> {
        self.set(
            &format!(":CALC{}:PAR{}:DEF", channel, trace),
            &format!("S{}{}", a, b),
        )
        .await
    }

    /// Single bus trigger, settle, then wait for operation complete.
    pub async fn trigger(&mut self) -> AppResult<String> {
        self.write(":TRIG:SING").await?;
        sleep(self.timing.settle).await;
        self.wait().await
    }

    /// Block on `*OPC?`.
    pub async fn wait(&mut self) -> AppResult<String> {
        self.query("*OPC?").await
    }

    pub async fn update_display(&mut self) -> AppResult<()> {
        self.write(":DISP:UPD").await
    }

    pub async fn auto_scale(&mut self, channel: u8, trace: u8) -> AppResult<()> {
        self.write(&format!(":DISP:WIND{}:TRAC{}:Y:AUTO", channel, trace))
            .await
    }

    /// Frequency axis in Hz.
    pub async fn get_x(&mut self, channel: u8) -> AppResult<Vec<f64>> {
        let command = format!(":CALC{}:DATA:XAX?", channel);
        let reply = self.query(&command).await?;
        parse_real_list(&command, &reply)
    }

    /// Corrected complex trace.
    pub async fn get_corrected_data(&mut self, channel: u8) -> AppResult<Vec<Complex64>> {
        let command = format!(":CALC{}:DATA:SDAT?", channel);
        let reply = self.query(&command).await?;
        parse_complex_list(&command, &reply)
    }

    /// Formatted trace (polar format is re-applied first).
    pub async fn get_formatted_data(&mut self, channel: u8) -> AppResult<Vec<Complex64>> {
        self.set_measurement_format(channel).await?;
        let command = format!(":CALC{}:DATA:FDAT?", channel);
        let reply = self.query(&command).await?;
        parse_complex_list(&command, &reply)
    }

    /// Uncorrected `S{a}{b}` data.
    pub async fn get_raw_data(&mut self, a: u8, b: u8) -> AppResult<Vec<Complex64>> {
        let command = format!(":SENS:DATA:RAWD? S{}{}", a, b);
        let reply = self.query(&command).await?;
        parse_complex_list(&command, &reply)
    }

    /// Drain the error queue. Each collected entry is logged as a warning.
    pub async fn get_errors(&mut self) -> AppResult<Vec<InstrumentFault>> {
        let mut faults = Vec::new();

        for _ in 0..MAX_ERROR_QUEUE_DEPTH {
            let reply = self.query(":SYST:ERR?").await?;
            let Some(captures) = ERROR_ENTRY.captures(&reply) else {
                break;
            };
            let code: i32 = captures[1]
                .trim()
                .parse()
                .map_err(|_| ChamberError::unexpected(":SYST:ERR?", reply.clone()))?;
            if code == 0 {
                return Ok(faults);
            }

            let fault = InstrumentFault {
                code,
                message: captures[2].trim().trim_matches('"').to_string(),
            };
            warn!("{}", fault);
            faults.push(fault);
        }

        if faults.len() >= MAX_ERROR_QUEUE_DEPTH {
            warn!("error queue did not empty after {} reads", MAX_ERROR_QUEUE_DEPTH);
        }
        Ok(faults)
    }

    /// Store the instrument state (including calibration) to [`STATE_FILE`].
    pub async fn save_state(&mut self) -> AppResult<()> {
        self.write(&format!(":MMEM:STOR \"{}\"", STATE_FILE)).await?;
        sleep(self.timing.save_state).await;
        Ok(())
    }

    /// Recall [`STATE_FILE`].
    pub async fn load_state(&mut self) -> AppResult<()> {
        self.write(&format!("MMEM:LOAD:STAT \"{}\"", STATE_FILE))
            .await?;
        sleep(self.timing.settle).await;
        Ok(())
    }

    /// Enable or disable error correction; returns the instrument's readback.
    pub async fn set_data_correction(&mut self, channel: u8, enable: bool) -> AppResult<String> {
        self.set(&format!(":SENS{}:CORR:STAT", channel), on_off(enable))
            .await
    }

    /// One-port electronic calibration on `port`.
    pub async fn calibrate_s11(&mut self, channel: u8, port: u8) -> AppResult<String> {
        self.write(&format!(":SENS{}:CORR:COLL:ECAL:SOLT1 {}", channel, port))
            .await?;
        sleep(self.timing.save_state).await;
        self.wait().await
    }

    pub async fn enable_display(&mut self, enable: bool) -> AppResult<()> {
        self.write(&format!(":DISP:ENAB {}", on_off(enable))).await
    }

    /// Re-enable the display and release the session.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let display = self.enable_display(true).await;
        debug!("Closing network analyzer");
        let close = self.close().await;
        match (display, close) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(ChamberError::ShutdownFailed(vec![a, b])),
        }
    }

    pub async fn close(&mut self) -> AppResult<()> {
        self.transport.close().await
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn parse_number(command: &str, reply: &str) -> AppResult<f64> {
    reply
        .trim()
        .parse::<f64>()
        .map_err(|_| ChamberError::unexpected(command, reply))
}

fn parse_real_list(command: &str, reply: &str) -> AppResult<Vec<f64>> {
    reply
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_number(command, s))
        .collect()
}

/// Interleaved `re,im,re,im,...` into complex values.
fn parse_complex_list(command: &str, reply: &str) -> AppResult<Vec<Complex64>> {
    let values = parse_real_list(command, reply)?;
    if values.len() % 2 != 0 {
        return Err(ChamberError::unexpected(command, reply));
    }
    Ok(values
        .chunks_exact(2)
        .map(|pair| Complex64::new(pair[0], pair[1]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockVna;
    use tracing_test::traced_test;

    fn session(mock: &MockVna) -> VnaSession {
        VnaSession::new(Box::new(mock.clone()), VnaTiming::immediate())
    }

    #[test]
    fn test_parse_complex_list() {
        let values = parse_complex_list("q", "+1.0E-1,-2.0E-1,3,4\n").unwrap();
        assert_eq!(
            values,
            vec![Complex64::new(0.1, -0.2), Complex64::new(3.0, 4.0)]
        );
        assert!(parse_complex_list("q", "1,2,3").is_err());
        assert!(parse_complex_list("q", "1,abc").is_err());
    }

    #[test]
    fn test_parse_scientific_frequency() {
        let values = parse_real_list("q", "+1.00000000000E+009,+2.5E+009").unwrap();
        assert_eq!(values, vec![1.0e9, 2.5e9]);
    }

    #[tokio::test]
    async fn test_setup_command_order() {
        let mock = MockVna::new();
        let mut vna = session(&mock);
        vna.setup(1, 1).await.unwrap();

        let writes = mock.writes().await;
        let expected = [
            ":DISP:SPL D1",
            ":DISP:WIND1:ACT",
            ":CALC1:PAR:COUN 1",
            ":CALC1:PAR1:SEL",
            ":SENS1:SWE:TYPE LIN",
            ":SENS1:SWE:GEN STEP",
            ":OUTP ON",
            ":SENS1:SWE:TIME:AUTO ON",
            ":SENS1:BAND 1000",
            ":INIT1:CONT ON",
            ":TRIG:SOUR BUS",
            ":CALC1:FORM POL",
            ":FORM:DATA ASC",
            ":SENS1:SWE:DEL 0",
            ":MMEM:STOR:SALL OFF",
            ":MMEM:STOR:STYP CDST",
        ];
        assert_eq!(writes, expected);
    }

    #[tokio::test]
    async fn test_setters_return_accepted_values() {
        let mock = MockVna::new();
        let mut vna = session(&mock);

        assert_eq!(vna.set_start(1, 1.0e9).await.unwrap(), 1.0e9);
        // Mock limits the stop frequency and point count
        assert_eq!(vna.set_stop(1, 20.0e9).await.unwrap(), MockVna::MAX_FREQUENCY_HZ);
        assert_eq!(vna.set_points(1, 5000).await.unwrap(), MockVna::MAX_POINTS);
        assert_eq!(vna.set_points(1, 201).await.unwrap(), 201);
        assert_eq!(vna.set_center(1, 2.0e9).await.unwrap(), 2.0e9);
        assert_eq!(vna.set_span(1, 5.0e8).await.unwrap(), 5.0e8);
        assert!(mock.writes().await.contains(&":SENS1:FREQ:SPAN 500000000".to_string()));
    }

    #[tokio::test]
    async fn test_get_errors_empty_queue() {
        let mock = MockVna::new();
        let mut vna = session(&mock);
        assert!(vna.get_errors().await.unwrap().is_empty());
        assert_eq!(mock.queries().await, vec![":SYST:ERR?"]);
    }

    #[tokio::test]
    async fn test_get_errors_drains_until_sentinel() {
        let mock = MockVna::new();
        mock.push_error(-113, "Undefined header").await;
        mock.push_error(-222, "Data out of range").await;
        let mut vna = session(&mock);

        let faults = vna.get_errors().await.unwrap();
        assert_eq!(
            faults,
            vec![
                InstrumentFault {
                    code: -113,
                    message: "Undefined header".to_string()
                },
                InstrumentFault {
                    code: -222,
                    message: "Data out of range".to_string()
                },
            ]
        );
        assert_eq!(mock.queries().await.len(), 3);
        assert!(vna.get_errors().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_sentinel_only_queue_logs_nothing() {
        let mock = MockVna::new();
        let mut vna = session(&mock);

        assert!(vna.get_errors().await.unwrap().is_empty());
        assert!(!logs_contain("Undefined"));
        assert!(!logs_contain("Error #"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_queued_fault_is_logged_and_collected() {
        let mock = MockVna::new();
        mock.push_error(-113, "Undefined header").await;
        let mut vna = session(&mock);

        let faults = vna.get_errors().await.unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].code, -113);
        assert!(logs_contain("-113"));
        assert!(logs_contain("Undefined header"));

        // Session keeps working after the drain
        assert_eq!(vna.set_points(1, 201).await.unwrap(), 201);
        assert!(vna.get_errors().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_setup_returns_drained_faults() {
        let mock = MockVna::new();
        mock.error_on(":CALC1:FORM", -113, "Undefined header").await;
        let mut vna = session(&mock);

        let faults = vna.setup(1, 1).await.unwrap();
        assert_eq!(
            faults,
            vec![InstrumentFault {
                code: -113,
                message: "Undefined header".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_trigger_and_acquire() {
        let mock = MockVna::new();
        let mut vna = session(&mock);
        vna.set_start(1, 1.0e9).await.unwrap();
        vna.set_stop(1, 2.0e9).await.unwrap();
        vna.set_points(1, 11).await.unwrap();

        assert_eq!(vna.trigger().await.unwrap(), "1");
        let x = vna.get_x(1).await.unwrap();
        assert_eq!(x.len(), 11);
        assert_eq!(x[0], 1.0e9);
        assert_eq!(x[10], 2.0e9);

        let data = vna.get_corrected_data(1).await.unwrap();
        assert_eq!(data.len(), 11);
        let formatted = vna.get_formatted_data(1).await.unwrap();
        assert_eq!(formatted.len(), 11);
        let raw = vna.get_raw_data(2, 1).await.unwrap();
        assert_eq!(raw.len(), 11);
    }

    #[tokio::test]
    async fn test_state_and_calibration_commands() {
        let mock = MockVna::new();
        let mut vna = session(&mock);

        vna.calibrate_s11(1, 2).await.unwrap();
        vna.save_state().await.unwrap();
        vna.load_state().await.unwrap();
        assert_eq!(vna.set_data_correction(1, true).await.unwrap(), "ON");
        vna.enable_display(false).await.unwrap();

        assert_eq!(
            mock.writes().await,
            vec![
                ":SENS1:CORR:COLL:ECAL:SOLT1 2",
                ":MMEM:STOR \"STAT03.STA\"",
                "MMEM:LOAD:STAT \"STAT03.STA\"",
                ":SENS1:CORR:STAT ON",
                ":DISP:ENAB OFF",
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_enables_display_and_closes() {
        let mock = MockVna::new();
        let mut vna = session(&mock);
        vna.shutdown().await.unwrap();
        assert_eq!(mock.writes().await, vec![":DISP:ENAB ON"]);
        assert!(mock.is_closed().await);
    }
}
