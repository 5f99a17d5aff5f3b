//! Mock Motor Controller
//!
//! Simulates the serial motor controller firmware so the protocol, motor devices
//! and sweep sequencer can run without hardware. All waiting uses
//! `tokio::time::sleep`.
//!
//! # Behaviour
//!
//! - Position registers are kept as controller indices per channel.
//! - Motion commands (`...,R`) update the index and queue a `^` acknowledgement
//!   unless motion is stalled, in which case the caller's read times out.
//! - `X`/`Y`/`Z`/`T` queue the channel's index as `+0001200\r`.
//! - `V` queues `R\r` (ready).
//!
//! Clones share state, so a test can keep one handle while the protocol owns
//! another.
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = MockMotorController::new();
//! let protocol = MotorProtocol::new(Box::new(mock.clone()), Duration::from_millis(50));
//! // ... drive motors ...
//! assert_eq!(mock.commands().await.last().unwrap(), "C");
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::protocol::Port;
use crate::adapters::SerialTransport;
use crate::error::{AppResult, ChamberError};

/// Index reported after seeking a limit switch.
pub const LIMIT_INDEX: i64 = 400_000;

#[derive(Debug, Default)]
struct MockBusState {
    index: [i64; 4],
    speed: [Option<u32>; 4],
    acceleration: [Option<u32>; 4],
    online: bool,
    closed: bool,
    stall_all: bool,
    stall_commands: Vec<String>,
    writes: Vec<Vec<u8>>,
    commands: Vec<String>,
    terminators: Vec<u8>,
    pending: VecDeque<u8>,
}

impl MockBusState {
    fn apply(&mut self, command: &str) {
        self.commands.push(command.to_string());

        match command {
            "F" => self.online = true,
            "Q" => self.online = false,
            "C" => {}
            "N" => self.index = [0; 4],
            "V" => self.reply("R\r"),
            "X" | "Y" | "Z" | "T" => {
                let slot = match command {
                    "X" => 0,
                    "Y" => 1,
                    "Z" => 2,
                    _ => 3,
                };
                let reply = format!("{:+08}\r", self.index[slot]);
                self.reply(&reply);
            }
            _ => self.apply_addressed(command),
        }
    }

    fn apply_addressed(&mut self, command: &str) {
        let Some((head, value)) = command.split_once('M') else {
            tracing::warn!(command, "mock controller ignoring unknown command");
            return;
        };

        let (kind, channel) = head.split_at(head.len().saturating_sub(1));
        let Some(slot) = channel
            .parse::<usize>()
            .ok()
            .filter(|c| (1..=4).contains(c))
            .map(|c| c - 1)
        else {
            tracing::warn!(command, "mock controller ignoring bad channel");
            return;
        };

        match (kind, value) {
            ("S", v) => self.speed[slot] = v.parse().ok(),
            ("A", v) => self.acceleration[slot] = v.parse().ok(),
            ("IA", "-0") => self.index[slot] = 0,
            ("IA", "0,R") => self.complete_motion(command, slot, |_| 0),
            ("I", "-0,R") => self.complete_motion(command, slot, |_| -LIMIT_INDEX),
            ("I", "0,R") => self.complete_motion(command, slot, |_| LIMIT_INDEX),
            ("I", v) => match v.strip_suffix(",R").and_then(|s| s.parse::<i64>().ok()) {
                Some(steps) => self.complete_motion(command, slot, |i| i + steps),
                None => tracing::warn!(command, "mock controller ignoring bad move"),
            },
            _ => tracing::warn!(command, "mock controller ignoring unknown command"),
        }
    }

    fn complete_motion(&mut self, command: &str, slot: usize, target: impl Fn(i64) -> i64) {
        if self.stall_all || self.stall_commands.iter().any(|c| c == command) {
            return;
        }
        self.index[slot] = target(self.index[slot]);
        self.reply("^");
    }

    fn reply(&mut self, text: &str) {
        self.pending.extend(text.bytes());
    }

    fn take_until(&mut self, terminator: u8) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == terminator)?;
        let bytes: Vec<u8> = self.pending.drain(..=end).collect();
        Some(
            String::from_utf8_lossy(&bytes[..bytes.len() - 1])
                .trim()
                .to_string(),
        )
    }
}

/// Simulated serial motor controller.
#[derive(Clone, Default)]
pub struct MockMotorController {
    state: Arc<Mutex<MockBusState>>,
}

impl MockMotorController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop acknowledging every motion command.
    pub async fn stall_motion(&self, stall: bool) {
        self.state.lock().await.stall_all = stall;
    }

    /// Stop acknowledging one specific command text (e.g. `"IA1M0,R"`).
    pub async fn stall_command(&self, command: impl Into<String>) {
        self.state.lock().await.stall_commands.push(command.into());
    }

    /// Force a channel's position register.
    pub async fn set_index(&self, port: Port, index: i64) {
        self.state.lock().await.index[usize::from(port.get()) - 1] = index;
    }

    /// Current position register of a channel.
    pub async fn index(&self, port: Port) -> i64 {
        self.state.lock().await.index[usize::from(port.get()) - 1]
    }

    pub async fn speed(&self, port: Port) -> Option<u32> {
        self.state.lock().await.speed[usize::from(port.get()) - 1]
    }

    pub async fn acceleration(&self, port: Port) -> Option<u32> {
        self.state.lock().await.acceleration[usize::from(port.get()) - 1]
    }

    pub async fn is_online(&self) -> bool {
        self.state.lock().await.online
    }

    /// Drop the simulated link; later writes fail.
    pub async fn disconnect(&self) {
        self.state.lock().await.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Every command received, without terminators.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }

    /// Every raw write, byte-exact.
    pub async fn raw_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().await.writes.clone()
    }

    /// Terminator byte of every read, in order.
    pub async fn read_terminators(&self) -> Vec<u8> {
        self.state.lock().await.terminators.clone()
    }

    /// Forget recorded traffic, keeping positions.
    pub async fn clear_log(&self) {
        let mut state = self.state.lock().await;
        state.writes.clear();
        state.commands.clear();
        state.terminators.clear();
    }
}

#[async_trait]
impl SerialTransport for MockMotorController {
    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(ChamberError::Connection("mock motor bus is closed".to_string()));
        }
        state.writes.push(data.to_vec());

        let text = String::from_utf8_lossy(data).into_owned();
        for command in text.split('\r').map(str::trim).filter(|c| !c.is_empty()) {
            state.apply(command);
        }
        Ok(())
    }

    async fn read_until(&mut self, terminator: u8, timeout: Duration) -> AppResult<String> {
        {
            let mut state = self.state.lock().await;
            state.terminators.push(terminator);
            if let Some(reply) = state.take_until(terminator) {
                return Ok(reply);
            }
        }

        sleep(timeout).await;
        Err(ChamberError::timeout(
            format!("{:?} from mock controller", terminator as char),
            timeout,
        ))
    }

    async fn close(&mut self) -> AppResult<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }

    fn describe(&self) -> String {
        "MockMotorController".to_string()
    }
}
