//! # e-Reg Control Library
//!
//! Headless control of an e-Reg electro-pneumatic pressure regulator. The
//! wire protocol lives in the `ereg_driver` crate; this crate adds the
//! timer-driven workers that share one protocol client, and the controller
//! that starts and stops them around the connection lifecycle.
//!
//! ## Crate Structure
//!
//! - **`capabilities`**: `SetpointWriter` / `BatchSampler` traits the workers
//!   depend on, implemented by the protocol client.
//! - **`polling`**: sample-and-retrieve cycle reduced to a median pressure.
//! - **`sweep`**: stepped setpoint ramp with live extension and cooperative
//!   cancellation.
//! - **`bleed`**: periodic dip-and-restore blips gated on the panel state.
//! - **`controller`**: connection lifecycle, worker supervision and the
//!   event stream.
//! - **`panel`**: operate / mode / setpoint state shared with the workers.
//! - **`history`**: JSON record of recent sweeps.
//! - **`config`**: figment settings (TOML + `EREG_` environment).
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.
//! - **`error`**: the `ControlError` type.

pub mod bleed;
pub mod capabilities;
pub mod config;
pub mod controller;
pub mod error;
pub mod history;
pub mod panel;
pub mod polling;
pub mod sweep;
pub mod tracing_setup;

pub use controller::{Controller, ControllerEvent, LinkState};
pub use error::{ControlError, ControlResult};
pub use panel::{OperateMode, PanelState};
pub use sweep::{SweepDirection, SweepParams};
