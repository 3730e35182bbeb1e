//! Configuration System using Figment
//!
//! Strongly-typed configuration for the collector. Sources, later ones winning:
//! 1. Built-in defaults
//! 2. A TOML file (`config/colosseum.toml` unless another path is given)
//! 3. Environment variables prefixed with `COLOSSEUM_`, `__` separating
//!    sections (e.g. `COLOSSEUM_SERIAL__PORT=/dev/ttyACM0`)
//!
//! # Example
//! ```no_run
//! use colosseum::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! println!("Port: {:?}", config.serial.port);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, CollectorError};
use crate::experiment::ControllerSettings;
use crate::hardware::{ChannelSettings, ReplyPolicy};
use crate::logging::{parse_log_level, LoggingConfig};
use crate::sequence::AngleTable;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/colosseum.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "COLOSSEUM_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Serial link to the collector
    pub serial: ChannelSettings,
    /// Delays and reply handling
    pub timing: TimingConfig,
    /// Carousel angle table
    pub angles: AnglesConfig,
    /// Subscriber setup
    pub logging: LoggingConfig,
}

/// `[timing]` section. All values in milliseconds except `reply_retries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after opening the port while the firmware boots
    pub boot_delay_ms: u64,
    /// Bound on the wait for the boot banner
    pub boot_timeout_ms: u64,
    /// Wait after the setup commands
    pub settle_ms: u64,
    /// Pause after each reply before the next frame
    pub command_gap_ms: u64,
    /// Per-attempt reply timeout
    pub reply_timeout_ms: u64,
    /// Extra reply read attempts after a timeout
    pub reply_retries: u32,
    /// Backoff before the first retry, doubled per retry
    pub retry_backoff_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            boot_delay_ms: 5000,
            boot_timeout_ms: 10_000,
            settle_ms: 1000,
            command_gap_ms: 100,
            reply_timeout_ms: 10_000,
            reply_retries: 2,
            retry_backoff_ms: 250,
        }
    }
}

impl TimingConfig {
    /// Reply timeout, retries and backoff as a [`ReplyPolicy`].
    pub fn reply_policy(&self) -> ReplyPolicy {
        ReplyPolicy {
            timeout: Duration::from_millis(self.reply_timeout_ms),
            retries: self.reply_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Millisecond values converted into [`ControllerSettings`].
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            boot_delay: Duration::from_millis(self.boot_delay_ms),
            boot_timeout: Duration::from_millis(self.boot_timeout_ms),
            settle: Duration::from_millis(self.settle_ms),
            command_gap: Duration::from_millis(self.command_gap_ms),
            reply: self.reply_policy(),
        }
    }
}

/// `[angles]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnglesConfig {
    /// Angle file; the built-in table is used when unset
    pub path: Option<PathBuf>,
}

impl AnglesConfig {
    /// Load the configured table, or the built-in one.
    pub fn load_table(&self) -> AppResult<AngleTable> {
        match &self.path {
            Some(path) => AngleTable::load(path),
            None => Ok(AngleTable::default()),
        }
    }
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment, then validate.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.logging.level)?;

        if self.serial.baud_rate == 0 {
            return Err(CollectorError::Configuration(
                "serial.baud_rate must be greater than zero".into(),
            ));
        }

        if self.timing.reply_timeout_ms == 0 {
            return Err(CollectorError::Configuration(
                "timing.reply_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.timing.boot_timeout_ms == 0 {
            return Err(CollectorError::Configuration(
                "timing.boot_timeout_ms must be greater than zero".into(),
            ));
        }

        Ok(())
    }

    /// Serial link settings for [`open_channel`](crate::hardware::open_channel).
    pub fn channel_settings(&self) -> ChannelSettings {
        self.serial.clone()
    }

    /// Shorthand for `self.timing.controller_settings()`.
    pub fn controller_settings(&self) -> ControllerSettings {
        self.timing.controller_settings()
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            CollectorError::Configuration(format!("Failed to render configuration: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::OutputFormat;

    #[test]
    fn test_defaults_match_firmware() {
        let config = AppConfig::default();
        assert_eq!(config.serial.baud_rate, 2_000_000);
        assert!(!config.serial.simulate);
        assert!(config.validate().is_ok());

        let settings = config.controller_settings();
        assert_eq!(settings.boot_delay, Duration::from_secs(5));
        assert_eq!(settings.command_gap, Duration::from_millis(100));
        assert_eq!(settings.reply, ReplyPolicy::default());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.logging.level = "chatty".into();
        assert!(matches!(
            config.validate(),
            Err(CollectorError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_reply_timeout() {
        let mut config = AppConfig::default();
        config.timing.reply_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_rendering_parses_back() {
        let mut config = AppConfig::default();
        config.serial.port = Some("/dev/ttyACM0".into());
        config.logging.format = OutputFormat::Json;

        let text = config.to_toml().unwrap();
        assert!(text.contains("[serial]"));
        assert!(text.contains("baud_rate = 2000000"));

        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_builtin_angles_when_unset() {
        let table = AnglesConfig::default().load_table().unwrap();
        assert_eq!(table, AngleTable::default());
    }
}
