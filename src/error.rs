//! Custom error types for the collector.
//!
//! This module defines the primary error type, `CollectorError`, used across the
//! library. Using the `thiserror` crate, it provides a centralized and consistent way
//! to report the failures that can occur while driving the fraction collector, from
//! opening the serial link to sequencing a run.
//!
//! ## Error Taxonomy
//!
//! - **`Connection`**: The serial transport could not be acquired.
//! - **`InvalidState`**: A control call was made from a state that does not allow it,
//!   such as `start` after the run is `Done` or `resume` before any `start`.
//! - **`Timeout`**: No reply frame arrived within the bounded wait.
//! - **`Validation`**: Run parameters or unit arithmetic were rejected before any
//!   frame was sent (non-positive flow, fraction count beyond the angle table, ...).
//! - **`MalformedFrame`**: A string could not be parsed back into a command.
//! - **`Config`** / **`Configuration`**: Loading or semantic validation of the
//!   configuration failed.
//!
//! Frames that fail `protocol::is_valid` are *not* errors. They are dropped before
//! transmission and only logged.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the collector error type.
pub type AppResult<T> = std::result::Result<T, CollectorError>;

/// Every failure the collector library reports.
#[derive(Error, Debug)]
pub enum CollectorError {
    /// The serial transport could not be opened
    #[error("Connection error: {0}")]
    Connection(String),

    /// Control call not allowed in the current run state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No reply frame within the bounded wait
    #[error("No reply frame received within {0:?}")]
    Timeout(Duration),

    /// Rejected parameters or unit arithmetic
    #[error("Validation error: {0}")]
    Validation(String),

    /// Text that does not parse as a command frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// I/O attempted on a closed port
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// The port reported end of stream
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    /// Built without the `instrument_serial` feature
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// OS-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Figment could not load or extract the configuration
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed semantic checks
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for CollectorError {
    fn from(value: figment::Error) -> Self {
        CollectorError::Config(Box::new(value))
    }
}
