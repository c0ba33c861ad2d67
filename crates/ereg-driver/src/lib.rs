//! e-Reg Pressure Regulator Driver
//!
//! This crate talks to an electro-pneumatic pressure regulator over its
//! line-oriented TCP command protocol (default port 10001).
//!
//! # Layers
//!
//! - [`Transport`] - owns the socket; one lock around every command/response pair
//! - [`EReg`] - typed getters and setters with local range validation
//! - [`ERegError`] - validation / connection / negative-acknowledgement / unexpected
//! - [`units`] - mBar <-> psi conversion
//! - [`MockEReg`] - loopback mock speaking the same protocol
//!
//! # Usage
//!
//! ```rust,ignore
//! use ereg_driver::{EReg, DEFAULT_PORT, DEFAULT_TIMEOUT};
//!
//! let ereg = EReg::new();
//! ereg.open_connection("192.168.1.100", DEFAULT_PORT, DEFAULT_TIMEOUT).await?;
//! let calibration = ereg.refresh_calibration().await?;
//! ereg.valves_on().await?;
//! ereg.set_pressure(calibration / 2.0).await?;
//! ```

pub mod error;
pub mod mock;
pub mod protocol;
pub mod transport;
pub mod units;

pub use error::{ERegError, ERegResult, ErrorKind};
pub use mock::MockEReg;
pub use protocol::{DeviceDefaults, EReg, Metadata, SampleBuffer};
pub use transport::{Transport, DEFAULT_PORT, DEFAULT_TIMEOUT};
