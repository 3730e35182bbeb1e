//! Tracing Infrastructure
//!
//! Structured logging for the collector built on `tracing` and
//! `tracing-subscriber`:
//! - Structured events with fields (`position`, `frame`, `reply`, `dwell_s`, ...)
//! - The run loop executes inside a `run` span, so its events carry the run context
//! - Multiple output formats (pretty, compact, JSON)
//! - `RUST_LOG` overrides the configured level
//!
//! # Example
//! ```no_run
//! use colosseum::{config::AppConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init(&config.logging)?;
//! info!("Collector starting");
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, CollectorError};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, colored (interactive use)
    Pretty,
    /// One line per event, no colors
    Compact,
    /// JSON objects for log aggregation
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = CollectorError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(CollectorError::Configuration(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            ))),
        }
    }
}

/// `[logging]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output layout
    pub format: OutputFormat,
    /// Emit span open/close events
    pub span_events: bool,
    /// Include source file and line numbers
    pub file_and_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Compact,
            span_events: false,
            file_and_line: false,
        }
    }
}

impl LoggingConfig {
    /// Replace the level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Replace the output layout.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Install the global subscriber described by `config`.
///
/// Idempotent: if a global subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())` and leaves it in place.
///
/// # Errors
/// `CollectorError::Configuration` for an unknown level.
pub fn init(config: &LoggingConfig) -> AppResult<()> {
    let level = parse_log_level(&config.level)?;
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(level)));

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.file_and_line)
            .with_line_number(config.file_and_line)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.file_and_line)
            .with_line_number(config.file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.file_and_line)
            .with_line_number(config.file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    // Losing a race with another initialiser is fine.
    if let Err(e) = tracing_subscriber::registry().with(layer).try_init() {
        tracing::debug!(error = %e, "Global subscriber already installed");
    }
    Ok(())
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(CollectorError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}
