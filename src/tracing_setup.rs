//! Tracing initialisation.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and one of
//! three output formats. `RUST_LOG` wins over the configured level.
//!
//! # Example
//! ```no_run
//! use ereg_control::config::Settings;
//! use ereg_control::tracing_setup::{self, OutputFormat, TracingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! let config = TracingConfig::from_settings(&settings)?.with_format(OutputFormat::Json);
//! tracing_setup::init(config)?;
//! tracing::info!(host = %settings.instrument.host, "Starting controller");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line, coloured (interactive use)
    #[default]
    Pretty,
    /// Single-line, no colours
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
        }
    }
}

impl TracingConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            ..Default::default()
        })
    }

    /// Config with the given default level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Install the global subscriber.
///
/// A second call is a no-op, so tests and embedding applications can call
/// this freely.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer().pretty().boxed(),
        OutputFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
        OutputFormat::Json => fmt::layer().json().boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(layer.with_filter(env_filter));
    tracing::subscriber::set_global_default(subscriber).or_else(|e| {
        // Already initialised elsewhere (tests, embedding applications)
        if e.to_string().contains("a global default trace dispatcher has already been set") {
            Ok(())
        } else {
            Err(format!("Failed to initialize tracing: {}", e))
        }
    })
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level).map_err(|_| {
        format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("Compact".parse::<OutputFormat>().unwrap(), OutputFormat::Compact);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.application.log_level = "trace".into();
        let config = TracingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, Level::TRACE);
        assert_eq!(config.format, OutputFormat::Pretty);

        let config = config.with_format(OutputFormat::Json);
        assert_eq!(config.format, OutputFormat::Json);
        assert_eq!(config.level, Level::TRACE);
    }

    #[test]
    fn test_init_twice_is_ok() {
        let config = TracingConfig::new(Level::WARN).with_format(OutputFormat::Compact);
        assert!(init(config.clone()).is_ok());
        assert!(init(config).is_ok());
    }
}
