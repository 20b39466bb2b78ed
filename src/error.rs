//! Custom error types for the scan engine.
//!
//! This module defines `ScanError`, the single error type returned by the library.
//! Using the `thiserror` crate it gives a consistent shape to everything that can go
//! wrong between the deflection hardware and the exported image.
//!
//! ## Error Hierarchy
//!
//! - **`Device`**: An analog I/O call failed. Carries the driver's status code and
//!   message. A device error aborts the current raster pass; it is never retried.
//! - **`Configuration`**: A semantically invalid setting, e.g. a partial field that is
//!   larger than the frame or an unknown preset. Rejected before any loop starts.
//! - **`ConcurrencyViolation`**: An attempt to start a second acquisition loop while one
//!   is still active. The controller prevents this; the engine still detects it.
//! - **`Config`**: Wraps `figment` errors raised while parsing the settings file or
//!   environment overrides.
//! - **`Io`** / **`Export`**: Failures while writing the intensity map to disk.
//!
//! Nothing here is fatal to the process. Every failure is recovered from by
//! reconfiguring and starting a new scan.

use crate::hardware::DeviceError;
use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Errors raised by the scan engine, its controller and its collaborators.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Hardware/driver call failed.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Invalid resolution, window, preset or setting.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A second acquisition loop was started while one was active.
    #[error("Acquisition loop already running")]
    ConcurrencyViolation,

    /// Settings could not be parsed.
    #[error("Settings error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// I/O failure while exporting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding failure while exporting.
    #[error("Export error: {0}")]
    Export(#[from] image::ImageError),

    /// The acquisition thread panicked.
    #[error("Acquisition thread panicked")]
    ThreadPanicked,
}

impl ScanError {
    /// Shorthand for building a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        ScanError::Configuration(message.into())
    }

    /// Whether this error came from the analog hardware.
    pub fn is_device(&self) -> bool {
        matches!(self, ScanError::Device(_))
    }
}

impl From<figment::Error> for ScanError {
    fn from(value: figment::Error) -> Self {
        ScanError::Config(Box::new(value))
    }
}
