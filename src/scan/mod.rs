//! Raster scanning: field geometry, axis code tables, the shared frame buffer, the
//! acquisition loop and the controller that coordinates them.

pub mod controller;
pub mod engine;
pub mod field;
pub mod frame;
pub mod mode;
pub mod raster;

pub use controller::{default_presets, Preset, ScanController, ScanStatus};
pub use engine::{AcquisitionLoop, LoopHandle, ScanExit, ScanReport};
pub use field::{CodeRange, Direction, PartialField, Resolution, ScanField};
pub use frame::{FrameBuffer, ScanShared};
pub use mode::ScanMode;
pub use raster::{axis_codes, RasterCache, RasterPlan};
