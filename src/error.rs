//! Error types for the controller.
//!
//! `ControlError` sits above the driver's [`ERegError`] taxonomy and adds the
//! failures that only exist at the controller level: configuration loading,
//! history persistence, panel-level bounds and rejected concurrent requests.
//!
//! ## Error Hierarchy
//!
//! - **`Instrument`**: anything the driver reports (validation, connection,
//!   negative acknowledgement, unexpected response). The variant is kept
//!   intact so callers can route on [`ERegError::kind`].
//! - **`Config`** / **`Configuration`**: figment extraction failures and
//!   semantic validation of the loaded settings.
//! - **`Io`** / **`Json`**: sweep history file access.
//! - **`Validation`**: a panel input outside its bounds (mBar range, blip
//!   rate, sweep span). Never reaches the wire.
//! - **`Busy`**: a request that would start a second concurrent worker.
//! - **`NotConnected`**: an operation that needs a live connection.

use ereg_driver::{ERegError, ErrorKind};
use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Controller-level error.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Error reported by the instrument driver.
    #[error(transparent)]
    Instrument(#[from] ERegError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Loaded configuration is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// History file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// History file could not be (de)serialized.
    #[error("History serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Input outside its documented bounds.
    #[error("Invalid value: {0}")]
    Validation(String),

    /// A worker of this kind is already running.
    #[error("Busy: {0}")]
    Busy(String),

    /// No live connection to the regulator.
    #[error("Not connected to the regulator")]
    NotConnected,
}

impl From<figment::Error> for ControlError {
    fn from(err: figment::Error) -> Self {
        ControlError::Config(Box::new(err))
    }
}

impl ControlError {
    /// Driver error kind, when this error came from the instrument.
    pub fn instrument_kind(&self) -> Option<ErrorKind> {
        match self {
            ControlError::Instrument(err) => Some(err.kind()),
            _ => None,
        }
    }

    /// Whether the error means the connection is gone.
    pub fn is_connection(&self) -> bool {
        match self {
            ControlError::Instrument(err) => err.is_connection(),
            ControlError::NotConnected => true,
            _ => false,
        }
    }
}
