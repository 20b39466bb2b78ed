//! Mock Hardware Implementations
//!
//! Provides simulated analog ports for running and testing without a DAQ board.
//!
//! # Available Mocks
//!
//! - `SimulatedPort` - Synthetic specimen driven by the last written deflection codes
//! - `RecordingPort` - Instrumented fake for tests: call counters, concurrent-caller
//!   high-water mark, programmable detector response and failure injection
//!
//! Both are blocking (`std::thread::sleep` for latency), matching the single-point
//! driver calls they stand in for.

use rand::Rng;
use std::sync::atomic::{AtomicI16, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::hardware::analog::{AnalogPort, DeviceError, Wiring};

/// Driver status used for injected failures.
pub const INJECTED_FAILURE_CODE: i32 = -10_001;

/// Tracks the last code written to each deflection axis.
#[derive(Debug)]
struct BeamPosition {
    x: AtomicI16,
    y: AtomicI16,
}

impl BeamPosition {
    fn new() -> Self {
        Self {
            x: AtomicI16::new(0),
            y: AtomicI16::new(0),
        }
    }

    fn store(&self, wiring: &Wiring, channel: u16, code: i16) {
        if channel == wiring.x_channel {
            self.x.store(code, Ordering::SeqCst);
        } else if channel == wiring.y_channel {
            self.y.store(code, Ordering::SeqCst);
        }
    }

    fn load(&self) -> (i16, i16) {
        (self.x.load(Ordering::SeqCst), self.y.load(Ordering::SeqCst))
    }
}

// =============================================================================
// SimulatedPort - Synthetic specimen
// =============================================================================

/// A circular feature of the simulated specimen, in normalised field coordinates.
#[derive(Debug, Clone, Copy)]
struct Disc {
    cx: f64,
    cy: f64,
    radius: f64,
    level: f64,
}

/// Simulated analog port imaging a fixed synthetic specimen.
///
/// The specimen is a handful of bright discs on a dark, noisy background. The
/// detector value depends on the beam position given by the last codes written to
/// the X and Y outputs, so a raster scan produces a recognisable image.
/// Higher gain settings average more and therefore reduce the noise.
///
/// # Example
///
/// ```rust,ignore
/// let port = SimulatedPort::new(Wiring::default());
/// port.write_analog_out(1, 0, 0)?;
/// port.write_analog_out(1, 1, 0)?;
/// let sample = port.read_analog_in(1, 0, 1)?;
/// ```
pub struct SimulatedPort {
    wiring: Wiring,
    beam: BeamPosition,
    code_range: (i16, i16),
    latency: Duration,
    discs: Vec<Disc>,
}

impl SimulatedPort {
    /// Create a simulated port with the standard 12-bit code range and no latency.
    pub fn new(wiring: Wiring) -> Self {
        Self {
            wiring,
            beam: BeamPosition::new(),
            code_range: (-2048, 2047),
            latency: Duration::ZERO,
            discs: vec![
                Disc { cx: 0.30, cy: 0.35, radius: 0.12, level: 1500.0 },
                Disc { cx: 0.68, cy: 0.30, radius: 0.07, level: 900.0 },
                Disc { cx: 0.55, cy: 0.70, radius: 0.18, level: 1200.0 },
                Disc { cx: 0.15, cy: 0.80, radius: 0.05, level: 1900.0 },
            ],
        }
    }

    /// Simulate a per-read hardware transaction time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Override the code range used to normalise beam positions.
    pub fn with_code_range(mut self, min: i16, max: i16) -> Self {
        self.code_range = (min, max);
        self
    }

    fn normalise(&self, code: i16) -> f64 {
        let (min, max) = self.code_range;
        let span = f64::from(max) - f64::from(min);
        if span <= 0.0 {
            return 0.0;
        }
        (f64::from(code) - f64::from(min)) / span
    }

    fn specimen(&self, x: f64, y: f64) -> f64 {
        let background = -1500.0 + 300.0 * x;
        self.discs
            .iter()
            .filter(|d| (x - d.cx).powi(2) + (y - d.cy).powi(2) <= d.radius.powi(2))
            .map(|d| d.level)
            .fold(background, f64::max)
    }
}

impl AnalogPort for SimulatedPort {
    fn write_analog_out(&self, _device: u16, channel: u16, code: i16) -> Result<(), DeviceError> {
        self.beam.store(&self.wiring, channel, code);
        Ok(())
    }

    fn read_analog_in(&self, _device: u16, _channel: u16, gain: i16) -> Result<i16, DeviceError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let (x, y) = self.beam.load();
        let signal = self.specimen(self.normalise(x), self.normalise(y));
        let spread = 200.0 / f64::from(gain.max(1)).sqrt();
        let noise = rand::thread_rng().gen_range(-spread..=spread);
        Ok((signal + noise).round().clamp(-2048.0, 2047.0) as i16)
    }
}

// =============================================================================
// RecordingPort - Instrumented fake
// =============================================================================

type ReadFn = Box<dyn Fn(i16, i16) -> i16 + Send + Sync>;

/// Instrumented analog port for tests.
///
/// Records call counts and the largest number of callers that were inside the port
/// at the same time. The detector response is a function of the last written
/// `(x_code, y_code)` and can be swapped at runtime. A failure can be armed for the
/// n-th write call (1-based, counted over the port's lifetime). Every change of the
/// read gain is kept, in call order.
pub struct RecordingPort {
    wiring: Wiring,
    beam: BeamPosition,
    writes: AtomicUsize,
    reads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_on_write: Mutex<Option<usize>>,
    gains: Mutex<Vec<i16>>,
    latency: Duration,
    read_fn: Mutex<ReadFn>,
}

impl RecordingPort {
    /// Create a recording port returning zero for every read.
    pub fn new(wiring: Wiring) -> Self {
        Self {
            wiring,
            beam: BeamPosition::new(),
            writes: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_on_write: Mutex::new(None),
            gains: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            read_fn: Mutex::new(Box::new(|_, _| 0)),
        }
    }

    /// Simulate a per-call hardware transaction time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the detector response.
    pub fn set_read_fn<F>(&self, f: F)
    where
        F: Fn(i16, i16) -> i16 + Send + Sync + 'static,
    {
        *lock(&self.read_fn) = Box::new(f);
    }

    /// Fail the n-th write call (1-based, lifetime count).
    pub fn fail_on_write(&self, n: usize) {
        *lock(&self.fail_on_write) = Some(n);
    }

    /// Total write calls so far, including a failed one.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Total read calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Distinct read gains in the order they were first used after a change.
    pub fn gain_history(&self) -> Vec<i16> {
        lock(&self.gains).clone()
    }

    /// Gain passed to the most recent read.
    pub fn last_gain(&self) -> Option<i16> {
        lock(&self.gains).last().copied()
    }

    /// Largest number of threads observed inside the port at once.
    pub fn max_concurrent_callers(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        InFlight(&self.in_flight)
    }
}

impl AnalogPort for RecordingPort {
    fn write_analog_out(&self, _device: u16, channel: u16, code: i16) -> Result<(), DeviceError> {
        let _guard = self.enter();
        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if *lock(&self.fail_on_write) == Some(n) {
            return Err(DeviceError::new(
                INJECTED_FAILURE_CODE,
                format!("injected failure on write {n}"),
            ));
        }
        self.beam.store(&self.wiring, channel, code);
        Ok(())
    }

    fn read_analog_in(&self, _device: u16, _channel: u16, gain: i16) -> Result<i16, DeviceError> {
        let _guard = self.enter();
        self.reads.fetch_add(1, Ordering::SeqCst);
        {
            let mut gains = lock(&self.gains);
            if gains.last() != Some(&gain) {
                gains.push(gain);
            }
        }
        let (x, y) = self.beam.load();
        Ok((lock(&self.read_fn))(x, y))
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
