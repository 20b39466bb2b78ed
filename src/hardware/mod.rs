//! Hardware boundary
//!
//! The analog I/O capability consumed by the scan engine, and simulated ports for
//! running without a DAQ board.

pub mod analog;
pub mod mock;

pub use analog::{AnalogPort, DeviceError, Wiring};
pub use mock::{RecordingPort, SimulatedPort};
