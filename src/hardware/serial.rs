//! Serial transport for the collector firmware.
//!
//! Wraps the `serialport` crate and runs its blocking I/O on Tokio's blocking
//! task executor. The port is opened 8N1 with a short internal read timeout;
//! [`crate::protocol::read_frame`] layers the overall reply deadline on top.

use crate::error::{AppResult, CollectorError};
use crate::hardware::channel::SerialChannel;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Baud rate the collector firmware is built for.
pub const DEFAULT_BAUD_RATE: u32 = 2_000_000;

/// Internal per-read timeout of the OS port handle.
#[cfg(feature = "instrument_serial")]
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// RS-232/USB-serial link to the collector.
pub struct SerialPortChannel {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    port_name: String,

    /// Baud rate
    baud_rate: u32,

    /// The open port (behind Arc<Mutex> for the blocking executor)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialPortChannel {
    /// Open `port_name` at `baud_rate`.
    ///
    /// # Errors
    /// Returns `CollectorError::Connection` if the port cannot be opened.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port_name: &str, baud_rate: u32) -> AppResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(PORT_READ_TIMEOUT)
            .open()
            .map_err(|e| {
                CollectorError::Connection(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    port_name, baud_rate, e
                ))
            })?;

        debug!(port = port_name, baud_rate, "Serial port opened");

        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            port: Some(Arc::new(Mutex::new(port))),
        })
    }

    /// Always fails: built without serial support.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(_port_name: &str, _baud_rate: u32) -> AppResult<Self> {
        Err(CollectorError::SerialFeatureDisabled)
    }

    #[cfg(feature = "instrument_serial")]
    fn handle(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .as_ref()
            .cloned()
            .ok_or(CollectorError::SerialPortNotConnected)
    }
}

#[cfg(feature = "instrument_serial")]
fn join_error(e: tokio::task::JoinError) -> CollectorError {
    CollectorError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("Serial I/O task panicked: {}", e),
    ))
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl SerialChannel for SerialPortChannel {
    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        use std::io::Write;

        let port = self.handle()?;
        let payload = bytes.to_vec();

        tokio::task::spawn_blocking(move || -> AppResult<()> {
            let mut guard = port.blocking_lock();
            // Drop whatever the firmware printed since the last reply.
            guard
                .clear(serialport::ClearBuffer::Input)
                .map_err(|e| CollectorError::Io(e.into()))?;
            guard.write_all(&payload)?;
            guard.flush()?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    async fn read_frame(&mut self, timeout: Duration) -> AppResult<String> {
        let port = self.handle()?;

        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            crate::protocol::read_frame(guard.as_mut(), timeout)
        })
        .await
        .map_err(join_error)?
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn describe(&self) -> String {
        format!("SerialPortChannel({} @ {} baud)", self.port_name, self.baud_rate)
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl SerialChannel for SerialPortChannel {
    async fn write(&mut self, _bytes: &[u8]) -> AppResult<()> {
        Err(CollectorError::SerialFeatureDisabled)
    }

    async fn read_frame(&mut self, _timeout: Duration) -> AppResult<String> {
        Err(CollectorError::SerialFeatureDisabled)
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("SerialPortChannel({} @ {} baud)", self.port_name, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_missing_port_is_connection_error() {
        let result = SerialPortChannel::open("/dev/colosseum-does-not-exist", DEFAULT_BAUD_RATE);
        match result {
            #[cfg(feature = "instrument_serial")]
            Err(CollectorError::Connection(msg)) => {
                assert!(msg.contains("/dev/colosseum-does-not-exist"));
                assert!(msg.contains("2000000"));
            }
            #[cfg(not(feature = "instrument_serial"))]
            Err(CollectorError::SerialFeatureDisabled) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("opened a port that should not exist"),
        }
    }
}
