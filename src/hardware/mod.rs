//! Transport layer for the collector.
//!
//! - [`channel`]: the [`SerialChannel`] trait and the send-then-await-reply
//!   primitive every command goes through.
//! - [`serial`]: the real serial-port transport (feature `instrument_serial`).
//! - [`mock`]: a simulated channel for dry runs and tests.

pub mod channel;
pub mod mock;
pub mod serial;

pub use channel::{transact, transact_raw, ReplyPolicy, SerialChannel};
pub use mock::{SimulatedChannel, Transcript};
pub use serial::{SerialPortChannel, DEFAULT_BAUD_RATE};

use crate::error::{AppResult, CollectorError};
use serde::{Deserialize, Serialize};

/// Where and how to reach the collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Serial device path; required unless `simulate` is set
    pub port: Option<String>,
    /// Line speed; the firmware expects 2 000 000
    pub baud_rate: u32,
    /// Use [`SimulatedChannel`] instead of a serial port
    pub simulate: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            simulate: false,
        }
    }
}

/// Open the channel described by `settings`.
///
/// # Errors
/// `CollectorError::Connection` when no port is configured for a real run, or
/// when the port cannot be opened.
pub fn open_channel(settings: &ChannelSettings) -> AppResult<Box<dyn SerialChannel>> {
    if settings.simulate {
        tracing::info!("Using simulated collector channel");
        return Ok(Box::new(SimulatedChannel::new()));
    }

    let port = settings.port.as_deref().ok_or_else(|| {
        CollectorError::Connection(
            "no serial port configured (set serial.port or enable simulation)".into(),
        )
    })?;

    let channel = SerialPortChannel::open(port, settings.baud_rate)?;
    tracing::info!(channel = %channel.describe(), "Serial channel opened");
    Ok(Box::new(channel))
}
