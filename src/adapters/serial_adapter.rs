//! Serial adapter for the motor controller bus.
//!
//! Wraps the `serialport` crate and runs the blocking I/O on Tokio's blocking
//! pool. The adapter does not append terminators itself: command framing belongs
//! to [`crate::hardware::protocol`].

use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::SerialTransport;
use crate::error::{AppResult, ChamberError};

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Internal poll interval of the OS-level port read.
#[cfg(feature = "instrument_serial")]
const PORT_POLL: Duration = Duration::from_millis(100);

/// Serial adapter for RS-232 communication
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600)
    baud_rate: u32,

    /// The actual serial port (behind Arc<Mutex> for the blocking pool)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Create an unconnected adapter.
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Open the port.
    pub async fn open(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let name = self.port_name.clone();
            let baud = self.baud_rate;
            let port = tokio::task::spawn_blocking(move || {
                serialport::new(&name, baud).timeout(PORT_POLL).open()
            })
            .await
            .map_err(|e| ChamberError::Connection(format!("Serial open task panicked: {}", e)))?
            .map_err(|e| {
                ChamberError::Connection(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.port_name, self.baud_rate, e
                ))
            })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(ChamberError::FeatureNotEnabled(
                "instrument_serial".to_string(),
            ))
        }
    }

    /// Convenience constructor that opens immediately.
    pub async fn connect(port_name: impl Into<String>, baud_rate: u32) -> AppResult<Self> {
        let mut adapter = Self::new(port_name, baud_rate);
        adapter.open().await?;
        Ok(adapter)
    }

    /// True once [`open`](Self::open) has succeeded.
    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| ChamberError::Connection(format!("{} is not open", self.port_name)))
    }
}

#[async_trait]
impl SerialTransport for SerialAdapter {
    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let bytes = data.to_vec();

            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard.write_all(&bytes)?;
                port_guard.flush()?;
                debug!(
                    "Sent serial bytes: {:?}",
                    String::from_utf8_lossy(&bytes).trim_end()
                );
                Ok(())
            })
            .await
            .map_err(|e| ChamberError::Connection(format!("Serial I/O task panicked: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = data;
            Err(ChamberError::FeatureNotEnabled(
                "instrument_serial".to_string(),
            ))
        }
    }

    async fn read_until(&mut self, terminator: u8, timeout: Duration) -> AppResult<String> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;

            tokio::task::spawn_blocking(move || -> AppResult<String> {
                use std::io::Read;

                let mut port_guard = port.blocking_lock();
                let mut response = Vec::new();
                let mut buffer = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        return Err(ChamberError::timeout(
                            format!("{:?} on serial bus", terminator as char),
                            timeout,
                        ));
                    }

                    match port_guard.read(&mut buffer) {
                        Ok(0) => {
                            return Err(ChamberError::Connection(
                                "Unexpected EOF from serial port".to_string(),
                            ));
                        }
                        Ok(_) => {
                            if buffer[0] == terminator {
                                break;
                            }
                            response.push(buffer[0]);
                        }
                        // Port timeout is shorter than our overall timeout
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(e.into()),
                    }
                }

                let response = String::from_utf8_lossy(&response).trim().to_string();
                debug!("Received serial response: {:?}", response);
                Ok(response)
            })
            .await
            .map_err(|e| ChamberError::Connection(format!("Serial I/O task panicked: {}", e)))?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (terminator, timeout);
            Err(ChamberError::FeatureNotEnabled(
                "instrument_serial".to_string(),
            ))
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("SerialAdapter({} @ {} baud)", self.port_name, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0", 9600);
        assert_eq!(adapter.port_name, "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate, 9600);
        assert!(!adapter.is_connected());
    }

    #[test]
    fn test_describe() {
        let adapter = SerialAdapter::new("COM3", 9600);
        assert_eq!(adapter.describe(), "SerialAdapter(COM3 @ 9600 baud)");
    }

    #[tokio::test]
    async fn test_write_without_open_fails() {
        let mut adapter = SerialAdapter::new("/dev/null-port", 9600);
        assert!(adapter.write(b"F\r").await.is_err());
    }
}
