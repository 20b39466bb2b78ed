//! Scan mode shared between the controller and the acquisition loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Acquisition mode.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Continuous ──stop──> Idle
/// Idle ──record─> SinglePass ──pass complete / stop──> Idle
/// any running ──device error──> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanMode {
    /// No raster in progress; a running loop exits at its next check.
    #[default]
    Idle,
    /// Repeat full passes until stopped.
    Continuous,
    /// Run one pass, then return to `Idle`.
    SinglePass,
}

impl ScanMode {
    /// Whether the loop should keep scanning.
    pub fn is_running(&self) -> bool {
        !matches!(self, ScanMode::Idle)
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Idle => write!(f, "Idle"),
            ScanMode::Continuous => write!(f, "Continuous"),
            ScanMode::SinglePass => write!(f, "SinglePass"),
        }
    }
}
