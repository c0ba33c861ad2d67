//! Operator panel state shared between the controller and its workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Output mode selected on the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperateMode {
    /// Regulate to the setpoint
    #[default]
    Pressurize,
    /// Output 0 psi
    Vent,
    /// Output the full calibration pressure
    Bypass,
}

impl fmt::Display for OperateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperateMode::Pressurize => write!(f, "pressurize"),
            OperateMode::Vent => write!(f, "vent"),
            OperateMode::Bypass => write!(f, "bypass"),
        }
    }
}

impl FromStr for OperateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pressurize" => Ok(OperateMode::Pressurize),
            "vent" => Ok(OperateMode::Vent),
            "bypass" => Ok(OperateMode::Bypass),
            other => Err(format!(
                "Unknown mode '{}'. Must be one of: pressurize, vent, bypass",
                other
            )),
        }
    }
}

/// Snapshot of the panel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PanelState {
    /// Valves enabled
    pub operating: bool,
    /// Selected mode
    pub mode: OperateMode,
    /// Last accepted setpoint (mBar)
    pub setpoint_mbar: f64,
}

impl Default for PanelState {
    fn default() -> Self {
        Self {
            operating: false,
            mode: OperateMode::Pressurize,
            setpoint_mbar: 0.0,
        }
    }
}

impl PanelState {
    /// Operating in pressurize mode: the setpoint is live on the device.
    pub fn is_pressurizing(&self) -> bool {
        self.operating && self.mode == OperateMode::Pressurize
    }
}
