//! Configuration loading using Figment
//!
//! Settings are layered from:
//! 1. Built-in defaults
//! 2. A TOML file (default `config/ereg.toml`, missing file is fine)
//! 3. Environment variables prefixed with `EREG_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use ereg_control::config::Settings;
//!
//! // EREG_INSTRUMENT__HOST=10.0.0.7 overrides the file
//! let settings = Settings::load()?;
//! println!("Regulator at {}:{}", settings.instrument.host, settings.instrument.port);
//! # Ok::<(), ereg_control::error::ControlError>(())
//! ```

use crate::error::{ControlError, ControlResult};
use ereg_driver::units::MAX_PRESSURE_MBAR;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/ereg.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Regulator address and timeouts
    pub instrument: InstrumentConfig,
    /// Polling engine settings
    pub polling: PollingConfig,
    /// Sweep bounds
    pub sweep: SweepConfig,
    /// Supply-line bleed settings
    pub bleed: BleedConfig,
    /// Sweep history file
    pub history: HistoryConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Regulator connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// IP address or hostname
    pub host: String,
    /// TCP command port
    pub port: u16,
    /// Connect and per-exchange timeout in milliseconds
    pub timeout_ms: u64,
    /// Connect as soon as the controller starts
    pub connect_on_startup: bool,
}

/// Polling engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Tick interval in milliseconds
    pub interval_ms: u64,
    /// Device sample rate sent before each batch (ms between samples)
    pub sample_rate: u32,
    /// Samples per batch
    pub batch_size: u32,
}

/// Sweep bounds in mBar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Highest pressure a sweep may reach
    pub max_pressure_mbar: i32,
    /// Sweeps ending below this are logged as a warning
    pub low_pressure_warning_mbar: i32,
}

/// Bleed blip settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleedConfig {
    /// Depth of each dip below the setpoint
    pub dip_mbar: i32,
    /// Time spent at the dip before restoring, in milliseconds
    pub dwell_ms: u64,
    /// Blips allowed in flight at once
    pub max_in_flight: usize,
}

/// Sweep history sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// JSON file holding recent sweeps
    pub path: PathBuf,
    /// Number of records retained
    pub keep: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            port: ereg_driver::DEFAULT_PORT,
            timeout_ms: 5000,
            connect_on_startup: true,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            sample_rate: 10,
            batch_size: 21,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            max_pressure_mbar: MAX_PRESSURE_MBAR,
            low_pressure_warning_mbar: 1000,
        }
    }
}

impl Default for BleedConfig {
    fn default() -> Self {
        Self {
            dip_mbar: 20,
            dwell_ms: 20,
            max_in_flight: 4,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sweep_history.json"),
            keep: 50,
        }
    }
}

impl InstrumentConfig {
    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and environment variables.
    pub fn load() -> ControlResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path, then validate.
    ///
    /// Environment variables override the file, e.g.
    /// `EREG_POLLING__INTERVAL_MS=500`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ControlResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("EREG_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges after loading.
    pub fn validate(&self) -> ControlResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ControlError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.instrument.host.trim().is_empty() {
            return invalid("instrument.host must not be empty");
        }
        if self.instrument.port == 0 {
            return invalid("instrument.port must be greater than 0");
        }
        if self.instrument.timeout_ms == 0 {
            return invalid("instrument.timeout_ms must be greater than 0");
        }

        if self.polling.interval_ms == 0 {
            return invalid("polling.interval_ms must be greater than 0");
        }
        if !(1..=200).contains(&self.polling.sample_rate) {
            return Err(ControlError::Configuration(format!(
                "polling.sample_rate {} must be between 1 and 200",
                self.polling.sample_rate
            )));
        }
        if !(1..=10000).contains(&self.polling.batch_size) {
            return Err(ControlError::Configuration(format!(
                "polling.batch_size {} must be between 1 and 10000",
                self.polling.batch_size
            )));
        }

        if self.sweep.max_pressure_mbar <= 0 {
            return invalid("sweep.max_pressure_mbar must be greater than 0");
        }
        if self.sweep.low_pressure_warning_mbar > self.sweep.max_pressure_mbar {
            return invalid(
                "sweep.low_pressure_warning_mbar must not exceed sweep.max_pressure_mbar",
            );
        }

        if self.bleed.dip_mbar <= 0 {
            return invalid("bleed.dip_mbar must be greater than 0");
        }
        if self.bleed.max_in_flight == 0 {
            return invalid("bleed.max_in_flight must be at least 1");
        }

        if self.history.keep == 0 {
            return invalid("history.keep must be at least 1");
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ControlResult<()> {
    Err(ControlError::Configuration(message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.instrument.port, 10001);
        assert_eq!(settings.instrument.timeout(), Duration::from_secs(5));
        assert_eq!(settings.polling.batch_size, 21);
        assert_eq!(settings.sweep.max_pressure_mbar, 3033);
        assert_eq!(settings.history.keep, 50);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.polling.sample_rate = 201;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.sweep.low_pressure_warning_mbar = 4000;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.bleed.max_in_flight = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[instrument]
host = "10.0.0.7"
connect_on_startup = false

[polling]
interval_ms = 500
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.instrument.host, "10.0.0.7");
        assert!(!settings.instrument.connect_on_startup);
        assert_eq!(settings.instrument.port, 10001);
        assert_eq!(settings.polling.interval_ms, 500);
        assert_eq!(settings.polling.batch_size, 21);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("/nonexistent/ereg.toml").unwrap();
        assert_eq!(settings.instrument.host, "192.168.1.100");
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("EREG_INSTRUMENT__PORT", "20002");
        std::env::set_var("EREG_BLEED__DIP_MBAR", "35");
        let result = Settings::load_from("/nonexistent/ereg.toml");
        std::env::remove_var("EREG_INSTRUMENT__PORT");
        std::env::remove_var("EREG_BLEED__DIP_MBAR");

        let settings = result.unwrap();
        assert_eq!(settings.instrument.port, 20002);
        assert_eq!(settings.bleed.dip_mbar, 35);
    }

    #[test]
    #[serial]
    fn test_invalid_file_value_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[history]\nkeep = 0").unwrap();
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ControlError::Configuration(_)));
    }
}
