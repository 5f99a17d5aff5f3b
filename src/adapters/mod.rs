//! Hardware adapter implementations
//!
//! This module defines the two byte-level transports the chamber talks through
//! and their real implementations:
//!
//! - [`SerialTransport`]: the shared motor controller bus. Reads are framed by a
//!   caller-supplied terminator byte because the bus switches between `\r` and
//!   `^` depending on the command class.
//! - [`InstrumentTransport`]: a line-oriented SCPI session to the network analyzer.
//!
//! Simulated counterparts live next to the devices that use them
//! ([`crate::hardware::mock`], [`crate::instrument::mock`]).

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppResult;

pub mod serial_adapter;
pub mod visa_adapter;

pub use serial_adapter::SerialAdapter;
pub use visa_adapter::VisaAdapter;

/// Raw access to the serial motor bus.
#[async_trait]
pub trait SerialTransport: Send {
    /// Write bytes to the bus and flush.
    async fn write(&mut self, data: &[u8]) -> AppResult<()>;

    /// Read until `terminator` is seen, returning the text before it.
    ///
    /// Fails with [`ChamberError::Timeout`](crate::error::ChamberError::Timeout) when
    /// the terminator does not arrive within `timeout`.
    async fn read_until(&mut self, terminator: u8, timeout: Duration) -> AppResult<String>;

    /// Release the underlying port.
    async fn close(&mut self) -> AppResult<()>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Request/response access to a SCPI instrument.
#[async_trait]
pub trait InstrumentTransport: Send {
    /// Send a command that produces no reply.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Send a query and return the trimmed reply line.
    async fn query(&mut self, command: &str) -> AppResult<String>;

    /// Release the instrument session.
    async fn close(&mut self) -> AppResult<()>;

    /// Resource identifier for logs.
    fn resource(&self) -> &str;
}
