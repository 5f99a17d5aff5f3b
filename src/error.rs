//! Custom error types for the application.
//!
//! This module defines the primary error type, `ChamberError`, for the whole crate.
//! Using the `thiserror` crate, it gives every layer (serial bus, analyzer session,
//! sweep sequencer, configuration store) one consistent way to report failure.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: an out-of-range motor parameter or a step count that does not fit
//!   the controller's 24-bit command field. Always raised before any bus I/O.
//! - **`Timeout`**: the motor controller or analyzer did not answer within the configured
//!   window. Never retried automatically; the caller decides.
//! - **`Instrument`**: the analyzer reported entries in its own error queue and the active
//!   [`ErrorPolicy`](crate::experiment::sweep::ErrorPolicy) says that is fatal.
//! - **`Connection`**: a device, bus or store could not be reached at startup.
//! - **`UnexpectedResponse`**: a reply could not be parsed into the expected shape.
//! - **`FeatureNotEnabled`**: code tried to use a transport or storage backend that was
//!   not compiled in.
//! - **`ShutdownFailed`**: collects every failure seen while releasing resources so that
//!   one failing handle does not hide the others.
//!
//! By using `#[from]`, `ChamberError` can be created from the underlying error types,
//! so the `?` operator works across the crate.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ChamberError>;

/// Every failure the acquisition stack can report.
#[derive(Error, Debug)]
pub enum ChamberError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timed out after {timeout:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: String,
        timeout: Duration,
    },

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unexpected response to '{command}': {response:?}")]
    UnexpectedResponse { command: String, response: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Configuration store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with {} error(s): {}", .0.len(), join_errors(.0))]
    ShutdownFailed(Vec<ChamberError>),
}

fn join_errors(errors: &[ChamberError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ChamberError {
    /// Shorthand for a timeout on a named operation.
    pub fn timeout(waiting_for: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            waiting_for: waiting_for.into(),
            timeout,
        }
    }

    /// Shorthand for a reply that could not be interpreted.
    pub fn unexpected(command: impl Into<String>, response: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            command: command.into(),
            response: response.into(),
        }
    }

    /// True for the timeout variant.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
