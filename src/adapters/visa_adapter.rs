//! VISA Hardware Adapter for GPIB instruments
//!
//! Provides [`InstrumentTransport`] over the VISA library via `visa-rs`. The
//! analyzer is either opened by explicit resource string or discovered as the
//! first resource on a bus type (`GPIB?*INSTR`). Blocking VISA calls run on
//! Tokio's blocking pool.
//!
//! The configured timeout is applied to the VISA session itself, so a silent
//! instrument fails the read inside the library. The task is also wrapped in a
//! Tokio timeout [`BACKSTOP_MARGIN`] longer than that; when the backstop fires
//! the session is dropped and later calls fail fast.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::InstrumentTransport;
use crate::error::{AppResult, ChamberError};

#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use visa_rs::attribute::{AttrTmoValue, HasAttribute};
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Extra time the blocking task gets beyond the VISA I/O timeout.
pub const BACKSTOP_MARGIN: Duration = Duration::from_secs(5);

/// VISA timeout attribute in milliseconds, saturating at `u32::MAX`.
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
fn backstop(timeout: Duration) -> Duration {
    timeout.saturating_add(BACKSTOP_MARGIN)
}

#[cfg(feature = "instrument_visa")]
fn apply_timeout(instrument: &Instrument, timeout: Duration) -> AppResult<()> {
    let millis = timeout_millis(timeout);
    let attr = AttrTmoValue::new_checked(millis).ok_or_else(|| {
        ChamberError::Connection(format!("VISA timeout {}ms out of range", millis))
    })?;
    instrument
        .set_attr(attr)
        .map_err(|e| ChamberError::Connection(format!("Failed to set VISA timeout: {}", e)))
}

/// Open session plus the resource manager that owns it.
///
/// Dropping the resource manager closes every session it opened, so both live together.
#[cfg(feature = "instrument_visa")]
struct VisaSession {
    _rm: DefaultRM,
    instrument: Instrument,
}

/// VISA adapter for SCPI communication
///
/// Supports resource strings like:
/// - "GPIB0::16::INSTR" (GPIB interface)
/// - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::16::INSTR")
    pub(crate) resource_string: String,

    /// Read/write timeout
    pub(crate) timeout: Duration,

    /// Line terminator for commands (typically "\n" for SCPI)
    pub(crate) line_terminator: String,

    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<VisaSession>>>,
}

impl VisaAdapter {
    /// Create an unconnected adapter for `resource_string`.
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(60),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            session: None,
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Open the configured resource.
    pub async fn open(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource = self.resource_string.clone();
            let timeout = self.timeout;
            let session = tokio::task::spawn_blocking(move || -> AppResult<VisaSession> {
                let rm = DefaultRM::new().map_err(|e| {
                    ChamberError::Connection(format!("Failed to create VISA resource manager: {}", e))
                })?;
                let name = CString::new(resource.clone()).map_err(|_| {
                    ChamberError::Connection(format!("Invalid VISA resource string: {}", resource))
                })?;
                let instrument = rm
                    .open(&name.into(), AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                    .map_err(|e| {
                        ChamberError::Connection(format!(
                            "Failed to open VISA resource {}: {}",
                            resource, e
                        ))
                    })?;
                apply_timeout(&instrument, timeout)?;
                Ok(VisaSession {
                    _rm: rm,
                    instrument,
                })
            })
            .await
            .map_err(|e| ChamberError::Connection(format!("VISA open task panicked: {}", e)))??;

            self.session = Some(Arc::new(Mutex::new(session)));
            debug!(
                "VISA resource '{}' opened with {}ms timeout",
                self.resource_string,
                self.timeout.as_millis()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(ChamberError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    /// Find the first resource on `bus` (e.g. "GPIB") and open it.
    pub async fn discover(bus: &str, timeout: Duration) -> AppResult<Self> {
        #[cfg(feature = "instrument_visa")]
        {
            let expr = format!("{}?*INSTR", bus);
            let found = tokio::task::spawn_blocking(move || -> AppResult<Option<String>> {
                let rm = DefaultRM::new().map_err(|e| {
                    ChamberError::Connection(format!("Failed to create VISA resource manager: {}", e))
                })?;
                let pattern = CString::new(expr.clone())
                    .map_err(|_| ChamberError::Connection(format!("Invalid pattern {}", expr)))?;
                let mut list = match rm.find_res_list(&pattern.into()) {
                    Ok(list) => list,
                    // VISA reports "no resources found" as an error
                    Err(_) => return Ok(None),
                };
                let first = list.find_next().map_err(|e| {
                    ChamberError::Connection(format!("VISA resource enumeration failed: {}", e))
                })?;
                Ok(first.map(|name| CString::from(name).to_string_lossy().into_owned()))
            })
            .await
            .map_err(|e| ChamberError::Connection(format!("VISA discovery task panicked: {}", e)))??;

            let resource = found.ok_or_else(|| {
                ChamberError::Connection(format!("No {} instrument found", bus))
            })?;
            log::info!("Discovered {} instrument at {}", bus, resource);

            let mut adapter = Self::new(resource).with_timeout(timeout);
            adapter.open().await?;
            Ok(adapter)
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = (bus, timeout);
            Err(ChamberError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    /// True once a session is open.
    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.session.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    #[cfg(feature = "instrument_visa")]
    async fn exchange(&mut self, command: &str, expect_reply: bool) -> AppResult<String> {
        let session = self.session.clone().ok_or_else(|| {
            ChamberError::Connection(format!("VISA resource {} not open", self.resource_string))
        })?;
        let framed = format!("{}{}", command, self.line_terminator);
        let command_for_log = command.to_string();
        let timeout = self.timeout;

        let task = tokio::task::spawn_blocking(move || -> AppResult<String> {
            use std::io::{BufRead, BufReader, Write};

            let guard = session.blocking_lock();
            apply_timeout(&guard.instrument, timeout)?;
            (&guard.instrument).write_all(framed.as_bytes())?;
            if !expect_reply {
                debug!("VISA write sent: {}", command_for_log);
                return Ok(String::new());
            }

            let mut reply = String::new();
            BufReader::new(&guard.instrument).read_line(&mut reply)?;
            let reply = reply.trim().to_string();
            debug!("VISA query '{}' -> '{}'", command_for_log, reply);
            Ok(reply)
        });

        match tokio::time::timeout(backstop(self.timeout), task).await {
            Ok(joined) => joined
                .map_err(|e| ChamberError::Connection(format!("VISA I/O task panicked: {}", e)))?,
            Err(_) => {
                log::warn!(
                    "VISA call on '{}' did not return; dropping the session",
                    self.resource_string
                );
                self.session = None;
                Err(ChamberError::timeout(
                    format!("reply to '{}'", command),
                    self.timeout,
                ))
            }
        }
    }
}

#[async_trait]
impl InstrumentTransport for VisaAdapter {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            self.exchange(command, false).await.map(|_| ())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(ChamberError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        #[cfg(feature = "instrument_visa")]
        {
            self.exchange(command, true).await
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = command;
            Err(ChamberError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.session.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource_string);
            }
        }
        Ok(())
    }

    fn resource(&self) -> &str {
        &self.resource_string
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("GPIB0::16::INSTR");
        assert!(!adapter.is_connected());
        assert_eq!(adapter.resource(), "GPIB0::16::INSTR");
        assert_eq!(adapter.timeout, Duration::from_secs(60));
        assert_eq!(adapter.line_terminator, "\n");
    }

    #[test]
    fn test_visa_adapter_builder() {
        let adapter = VisaAdapter::new("TCPIP0::192.168.1.100::INSTR")
            .with_timeout(Duration::from_millis(2000))
            .with_line_terminator("\r\n");

        assert_eq!(adapter.timeout, Duration::from_millis(2000));
        assert_eq!(adapter.line_terminator, "\r\n");
    }

    #[test]
    fn test_timeout_millis() {
        assert_eq!(timeout_millis(Duration::from_millis(2500)), 2500);
        assert_eq!(timeout_millis(Duration::from_secs(60)), 60_000);
        assert_eq!(timeout_millis(Duration::MAX), u32::MAX);
    }

    #[test]
    fn test_backstop_outlasts_visa_timeout() {
        let timeout = Duration::from_secs(60);
        assert_eq!(backstop(timeout), timeout + BACKSTOP_MARGIN);
        assert!(backstop(Duration::ZERO) > Duration::ZERO);
        assert_eq!(backstop(Duration::MAX), Duration::MAX);
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_disabled_feature_reports_flag() {
        let mut adapter = VisaAdapter::new("GPIB0::16::INSTR");
        let err = adapter.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, ChamberError::FeatureNotEnabled(ref f) if f == "instrument_visa"));
    }
}
