//! Acquisition Loop
//!
//! The scan engine. One activation runs on its own thread and repeats raster passes
//! while the shared mode says so:
//!
//! ```text
//! loop {
//!     field <- shared (re-read every pass)
//!     plan  <- raster cache
//!     for row, for col:            (mode checked before each row and pixel)
//!         write Y, write X, read detector, store cell
//!     SinglePass -> Idle
//!     Idle -> exit, else pause and repeat
//! }
//! ```
//!
//! Cancellation is cooperative: a stop request is observed at the next pixel, so the
//! worst-case latency is one pixel's worth of hardware calls plus the frame pause.
//! A device error aborts the activation, forces the mode to `Idle` and is returned
//! through the join handle. Cells written before the failure are left as they are.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{ScanError, ScanResult};
use crate::hardware::{AnalogPort, Wiring};
use crate::scan::field::ScanField;
use crate::scan::frame::ScanShared;
use crate::scan::mode::ScanMode;
use crate::scan::raster::{RasterCache, RasterPlan};

/// Pause between outer iterations.
pub const DEFAULT_FRAME_PAUSE: Duration = Duration::from_millis(10);

/// Why an activation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanExit {
    /// The mode was set to `Idle` from outside.
    Stopped,
    /// A `SinglePass` activation finished its pass.
    PassComplete,
}

/// Summary of a finished activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Full passes completed.
    pub frames: u64,
    /// Pixels acquired, including those of an abandoned pass.
    pub points: u64,
    /// How the activation ended.
    pub exit: ScanExit,
}

/// Point-by-point raster scanner over an analog port.
#[derive(Clone)]
pub struct AcquisitionLoop {
    port: Arc<dyn AnalogPort>,
    wiring: Wiring,
    frame_pause: Duration,
}

impl AcquisitionLoop {
    /// Scanner using `wiring` to address the port.
    pub fn new(port: Arc<dyn AnalogPort>, wiring: Wiring) -> Self {
        Self {
            port,
            wiring,
            frame_pause: DEFAULT_FRAME_PAUSE,
        }
    }

    /// Override the pause between outer iterations.
    pub fn with_frame_pause(mut self, pause: Duration) -> Self {
        self.frame_pause = pause;
        self
    }

    /// Set `mode` and run an activation on a new `scan-engine` thread.
    ///
    /// # Errors
    /// - `ConcurrencyViolation` if another activation is still active; the mode is
    ///   left untouched in that case
    /// - `Configuration` if `mode` is `Idle`
    pub fn start(self, shared: Arc<ScanShared>, mode: ScanMode) -> ScanResult<LoopHandle> {
        if !mode.is_running() {
            return Err(ScanError::config("cannot start a scan in Idle mode"));
        }
        let claim = shared.claim()?;
        shared.set_mode(mode);
        let spawned = thread::Builder::new()
            .name("scan-engine".into())
            .spawn(move || {
                let result = self.run(claim.shared());
                drop(claim);
                result
            });
        match spawned {
            Ok(handle) => Ok(LoopHandle { handle }),
            Err(e) => {
                shared.request_stop();
                Err(e.into())
            }
        }
    }

    /// Run an activation on the calling thread until the mode returns to `Idle`.
    pub fn run(&self, shared: &ScanShared) -> ScanResult<ScanReport> {
        let mut report = ScanReport {
            frames: 0,
            points: 0,
            exit: ScanExit::Stopped,
        };
        match self.run_passes(shared, &mut report) {
            Ok(()) => {
                info!(
                    frames = report.frames,
                    points = report.points,
                    exit = ?report.exit,
                    "scan thread terminating"
                );
                Ok(report)
            }
            Err(e) => {
                shared.request_stop();
                error!(error = %e, points = report.points, "scan aborted");
                Err(e)
            }
        }
    }

    fn run_passes(&self, shared: &ScanShared, report: &mut ScanReport) -> ScanResult<()> {
        let mut cache = RasterCache::new();
        loop {
            let (mode, field) = {
                let state = shared.lock();
                (state.mode, state.field)
            };
            if !mode.is_running() {
                return Ok(());
            }
            let plan = cache.plan_for(&field)?;
            if report.frames == 0 && report.points == 0 {
                info!(
                    resolution = %field.resolution,
                    window = ?field.window,
                    %mode,
                    gain = field.gain,
                    "scan started"
                );
            }

            let started = Instant::now();
            let completed = self.pass(shared, &field, &plan, report)?;
            if completed {
                report.frames += 1;
                let total = shared.record_frame();
                debug!(
                    frame = total,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "frame complete"
                );
            }

            if shared.finish_pass() == ScanMode::Idle {
                if completed && mode == ScanMode::SinglePass {
                    report.exit = ScanExit::PassComplete;
                }
                return Ok(());
            }
            thread::sleep(self.frame_pause);
        }
    }

    /// One traversal. Returns `false` if abandoned because the mode went `Idle`.
    fn pass(
        &self,
        shared: &ScanShared,
        field: &ScanField,
        plan: &RasterPlan,
        report: &mut ScanReport,
    ) -> ScanResult<bool> {
        let w = &self.wiring;
        for row in plan.rows.clone() {
            if !shared.mode().is_running() {
                return Ok(false);
            }
            let y = plan.y_codes[row as usize];
            for col in plan.cols.clone() {
                if !shared.mode().is_running() {
                    return Ok(false);
                }
                self.port.write_analog_out(w.device, w.y_channel, y)?;
                self.port
                    .write_analog_out(w.device, w.x_channel, plan.x_codes[col as usize])?;
                let sample = self
                    .port
                    .read_analog_in(w.device, w.signal_channel, field.gain)?;
                shared.store(row, col, sample);
                report.points += 1;
            }
        }
        Ok(true)
    }
}

/// Join handle for a running activation.
pub struct LoopHandle {
    handle: JoinHandle<ScanResult<ScanReport>>,
}

impl LoopHandle {
    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the thread exits and return its result.
    pub fn join(self) -> ScanResult<ScanReport> {
        self.handle.join().map_err(|_| ScanError::ThreadPanicked)?
    }

    /// Poll for termination every `interval`, then join.
    ///
    /// Blocks the calling thread only; the scan thread is never waited on while it
    /// holds the shared lock.
    pub fn wait(self, interval: Duration) -> ScanResult<ScanReport> {
        while !self.handle.is_finished() {
            thread::sleep(interval);
        }
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::RecordingPort;
    use crate::scan::field::{PartialField, Resolution};

    fn setup(n: u32) -> (Arc<RecordingPort>, Arc<ScanShared>, AcquisitionLoop) {
        let port = Arc::new(RecordingPort::new(Wiring::default()));
        let field = ScanField::new(Resolution::square(n).unwrap(), 1);
        let shared = Arc::new(ScanShared::new(field).unwrap());
        let engine = AcquisitionLoop::new(port.clone(), Wiring::default())
            .with_frame_pause(Duration::from_millis(1));
        (port, shared, engine)
    }

    #[test]
    fn single_pass_runs_exactly_once() {
        let (port, shared, engine) = setup(16);
        shared.set_mode(ScanMode::SinglePass);

        let report = engine.run(&shared).unwrap();

        assert_eq!(report.exit, ScanExit::PassComplete);
        assert_eq!(report.frames, 1);
        assert_eq!(report.points, 256);
        assert_eq!(port.read_count(), 256);
        assert_eq!(port.write_count(), 512);
        assert_eq!(shared.mode(), ScanMode::Idle);
    }

    #[test]
    fn idle_mode_does_nothing() {
        let (port, shared, engine) = setup(16);
        let report = engine.run(&shared).unwrap();
        assert_eq!(report.points, 0);
        assert_eq!(port.write_count(), 0);
    }

    #[test]
    fn stores_samples_row_major() {
        let (port, shared, engine) = setup(8);
        let codes = crate::scan::raster::axis_codes(8, Default::default());
        port.set_read_fn(move |x, y| {
            let col = codes.binary_search(&x).unwrap_or(0) as i16;
            let row = codes.binary_search(&y).unwrap_or(0) as i16;
            row * 8 + col
        });
        shared.set_mode(ScanMode::SinglePass);
        engine.run(&shared).unwrap();

        let frame = shared.snapshot();
        let expected: Vec<i16> = (0..64).collect();
        assert_eq!(frame.as_slice(), expected.as_slice());
    }

    #[test]
    fn window_limits_traversal() {
        let (port, shared, engine) = setup(32);
        let res = Resolution::square(32).unwrap();
        let mut field = shared.field();
        field.window = Some(PartialField::centered(res, 8));
        shared.update_field(field).unwrap();
        port.set_read_fn(|_, _| 9);
        shared.set_mode(ScanMode::SinglePass);

        let report = engine.run(&shared).unwrap();

        assert_eq!(report.points, 64);
        let frame = shared.snapshot();
        assert_eq!(frame.get(12, 12), Some(9));
        assert_eq!(frame.get(19, 19), Some(9));
        assert_eq!(frame.get(11, 12), Some(0));
        assert_eq!(frame.get(12, 20), Some(0));
    }

    #[test]
    fn device_error_aborts_and_goes_idle() {
        let (port, shared, engine) = setup(16);
        port.fail_on_write(50);
        shared.set_mode(ScanMode::Continuous);

        let err = engine.run(&shared).unwrap_err();

        assert!(err.is_device());
        assert_eq!(port.write_count(), 50);
        assert_eq!(port.read_count(), 24);
        assert_eq!(shared.mode(), ScanMode::Idle);
    }

    #[test]
    fn continuous_scan_stops_on_request() {
        let (port, shared, engine) = setup(16);
        let handle = engine.start(shared.clone(), ScanMode::Continuous).unwrap();

        while shared.frames_completed() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        shared.request_stop();
        let report = handle.wait(Duration::from_millis(5)).unwrap();

        assert_eq!(report.exit, ScanExit::Stopped);
        assert!(report.frames >= 2);
        assert!(!shared.is_active());
        let reads = port.read_count();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(port.read_count(), reads);
    }

    #[test]
    fn second_activation_is_rejected() {
        let (_port, shared, engine) = setup(16);
        let first = engine
            .clone()
            .start(shared.clone(), ScanMode::Continuous)
            .unwrap();

        let second = engine.clone().start(shared.clone(), ScanMode::SinglePass);
        assert!(matches!(second, Err(ScanError::ConcurrencyViolation)));
        assert_eq!(shared.mode(), ScanMode::Continuous);

        shared.request_stop();
        first.wait(Duration::from_millis(5)).unwrap();
        let third = engine.start(shared.clone(), ScanMode::SinglePass).unwrap();
        assert_eq!(third.join().unwrap().exit, ScanExit::PassComplete);
    }

    #[test]
    fn idle_start_is_rejected() {
        let (_port, shared, engine) = setup(16);
        let result = engine.start(shared.clone(), ScanMode::Idle);
        assert!(matches!(result, Err(ScanError::Configuration(_))));
        assert!(!shared.is_active());
    }
}
