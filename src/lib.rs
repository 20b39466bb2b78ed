//! # SEM Scan Controller Library
//!
//! Software-paced raster acquisition for a scanning electron microscope driven
//! through a multifunction analog I/O card. Two analog outputs steer the beam, one
//! analog input samples the detector, and every pixel is a write-Y, write-X, read
//! sequence issued by the host.
//!
//! ## Crate Structure
//!
//! - **`config`**: `Settings`, loaded with figment from defaults, a TOML file and
//!   `SEM_SCAN_` environment variables.
//! - **`display`**: 8-bit rescale, partial field overlay and the periodic refresher.
//! - **`error`**: The `ScanError` enum shared by every fallible operation.
//! - **`export`**: 16-bit TIFF export of the raw intensity map.
//! - **`hardware`**: The `AnalogPort` capability plus simulated and recording ports.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`scan`**: Field geometry, axis code tables, the shared frame buffer, the
//!   acquisition loop and the `ScanController` command layer.

pub mod config;
pub mod display;
pub mod error;
pub mod export;
pub mod hardware;
pub mod logging;
pub mod scan;

pub use error::{ScanError, ScanResult};
