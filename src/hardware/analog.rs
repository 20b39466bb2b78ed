//! Analog I/O Port
//!
//! The boundary between the scan engine and the data acquisition hardware. A port
//! exposes exactly two blocking operations, mirroring the single-point calls of the
//! DAQ driver:
//!
//! - `write_analog_out` drives one deflection output with a device code
//! - `read_analog_in` samples the detector input once with a gain setting
//!
//! # Contract
//! - Each call is one hardware transaction with bounded but unspecified latency
//! - Calls block the calling thread; the scan engine calls them only from its own thread
//! - Codes are raw device integers, not voltages
//!
//! # Thread Safety
//! Ports take `&self` and must be `Send + Sync`. Implementations keep any mutable
//! state behind interior mutability.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Driver failure reported by an analog port.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("driver status {code}: {message}")]
pub struct DeviceError {
    /// Driver status code (negative on the NI-DAQ family of drivers).
    pub code: i32,
    /// Human readable driver message.
    pub message: String,
}

impl DeviceError {
    /// Create a device error from a status code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Capability: single-point analog output and input.
pub trait AnalogPort: Send + Sync {
    /// Write one code to an analog output channel.
    ///
    /// # Returns
    /// - Ok(()) once the output has been updated
    /// - Err on driver failure
    fn write_analog_out(&self, device: u16, channel: u16, code: i16) -> Result<(), DeviceError>;

    /// Read one sample from an analog input channel.
    ///
    /// `gain` is the driver's gain/averaging setting and stands in for the dwell time.
    fn read_analog_in(&self, device: u16, channel: u16, gain: i16) -> Result<i16, DeviceError>;
}

/// Physical wiring of the deflection outputs and detector input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wiring {
    /// Device number assigned by the driver.
    pub device: u16,
    /// Analog output driving horizontal deflection.
    pub x_channel: u16,
    /// Analog output driving vertical deflection.
    pub y_channel: u16,
    /// Analog input carrying the detector signal.
    pub signal_channel: u16,
}

impl Default for Wiring {
    fn default() -> Self {
        Self {
            device: 1,
            x_channel: 0,
            y_channel: 1,
            signal_channel: 0,
        }
    }
}
