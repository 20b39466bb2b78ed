//! Scan Controller
//!
//! The command layer above the acquisition loop. It validates configuration changes
//! and runs the handshake that keeps at most one loop alive:
//!
//! ```text
//! stop-reallocate-start:
//!   1. mode <- Idle
//!   2. poll the previous loop until it has terminated (blocks the caller)
//!   3. reallocate the frame buffer / apply the new field
//!   4. mode <- Continuous
//!   5. spawn a new loop
//! ```
//!
//! Every command is idempotent with respect to its target state: stopping a stopped
//! scan, or moving a window that cannot move, does nothing.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::display::{DisplayFrame, DisplaySink};
use crate::error::{ScanError, ScanResult};
use crate::export;
use crate::hardware::AnalogPort;
use crate::scan::engine::{AcquisitionLoop, LoopHandle, ScanReport};
use crate::scan::field::{CodeRange, Direction, PartialField, Resolution, ScanField};
use crate::scan::frame::{FrameBuffer, ScanShared};
use crate::scan::mode::ScanMode;

/// A scan rate preset: frame size and nominal dwell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Identifier used by the command surface.
    pub id: u8,
    /// Square frame edge in pixels.
    pub resolution: u32,
    /// Gain passed to each detector read.
    pub dwell: i16,
}

/// The four standard run presets.
pub fn default_presets() -> Vec<Preset> {
    vec![
        Preset { id: 1, resolution: 128, dwell: 1 },
        Preset { id: 2, resolution: 256, dwell: 5 },
        Preset { id: 3, resolution: 512, dwell: 5 },
        Preset { id: 4, resolution: 1024, dwell: 5 },
    ]
}

/// Snapshot of controller state for the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStatus {
    /// Current mode.
    pub mode: ScanMode,
    /// Frame size.
    pub resolution: Resolution,
    /// Partial field, when enabled.
    pub window: Option<PartialField>,
    /// Gain used by detector reads.
    pub gain: i16,
    /// Whether a loop thread is still alive.
    pub loop_alive: bool,
    /// Full passes completed since the controller was created.
    pub frames_completed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    stop_poll: Duration,
    restart_pause: Duration,
}

/// Owns the shared scan state and the single acquisition loop handle.
pub struct ScanController {
    shared: Arc<ScanShared>,
    engine: AcquisitionLoop,
    presets: Vec<Preset>,
    codes: CodeRange,
    window: PartialField,
    window_enabled: bool,
    handle: Option<LoopHandle>,
    last_error: Option<ScanError>,
    timing: Timing,
    display: Option<Arc<dyn DisplaySink>>,
}

impl ScanController {
    /// Idle controller for `port`, configured from `settings`.
    ///
    /// No loop is started until a preset is selected or a scan is started.
    pub fn new(port: Arc<dyn AnalogPort>, settings: &Settings) -> ScanResult<Self> {
        settings.validate()?;
        let codes = settings.scan.codes();
        let resolution = Resolution::square(settings.scan.initial_resolution)?;
        let gain = settings.presets.first().map_or(1, |p| p.dwell);
        let field = ScanField::new(resolution, gain).with_codes(codes);
        let engine = AcquisitionLoop::new(port, settings.wiring)
            .with_frame_pause(settings.scan.frame_pause());

        Ok(Self {
            shared: Arc::new(ScanShared::new(field)?),
            engine,
            presets: settings.presets.clone(),
            codes,
            window: PartialField::centered(resolution, settings.partial_field.size),
            window_enabled: false,
            handle: None,
            last_error: None,
            timing: Timing {
                stop_poll: settings.scan.stop_poll(),
                restart_pause: settings.scan.restart_pause(),
            },
            display: None,
        })
    }

    /// Attach the display collaborator that draws the partial field overlay.
    pub fn with_display(mut self, sink: Arc<dyn DisplaySink>) -> Self {
        self.display = Some(sink);
        self
    }

    /// Shared state, for the display refresh path.
    pub fn shared(&self) -> Arc<ScanShared> {
        Arc::clone(&self.shared)
    }

    /// Current mode.
    pub fn mode(&self) -> ScanMode {
        self.shared.mode()
    }

    /// Apply a scan rate preset and restart in continuous mode.
    ///
    /// An enabled partial field is switched off first and re-centred for the new
    /// frame size.
    pub fn select_preset(&mut self, id: u8) -> ScanResult<()> {
        let preset = self
            .presets
            .iter()
            .find(|p| p.id == id)
            .copied()
            .ok_or_else(|| ScanError::config(format!("unknown preset {id}")))?;
        let resolution = Resolution::square(preset.resolution)?;
        let field = ScanField::new(resolution, preset.dwell).with_codes(self.codes);
        field.validate()?;

        if self.window_enabled {
            self.window_enabled = false;
            self.redraw_overlay();
        }
        self.halt();
        self.window = PartialField::centered(resolution, self.window.size);
        self.shared.reconfigure(field)?;
        info!(preset = id, %resolution, dwell = preset.dwell, "scan rate selected");
        self.launch(ScanMode::Continuous)
    }

    /// Request a stop without waiting for the loop to exit.
    pub fn stop(&self) {
        let previous = self.shared.request_stop();
        if previous.is_running() {
            info!(%previous, "scan stop requested");
        }
    }

    /// Start continuous scanning when idle, stop when running.
    pub fn toggle_run(&mut self) -> ScanResult<()> {
        if self.mode().is_running() {
            self.stop();
            return Ok(());
        }
        thread::sleep(self.timing.restart_pause);
        self.halt();
        self.launch(ScanMode::Continuous)
    }

    /// Acquire one full pass of the current field, then stop.
    ///
    /// A continuous scan is stopped and waited for first. Issued during a single
    /// pass, this does nothing.
    pub fn record(&mut self) -> ScanResult<()> {
        match self.mode() {
            ScanMode::SinglePass => Ok(()),
            ScanMode::Continuous => {
                self.halt();
                self.launch(ScanMode::SinglePass)
            }
            ScanMode::Idle => {
                thread::sleep(self.timing.restart_pause);
                self.halt();
                self.launch(ScanMode::SinglePass)
            }
        }
    }

    /// Switch the partial field on or off.
    ///
    /// Runs the stop-reallocate-start handshake, so the scan always resumes in
    /// continuous mode from the new bounds. Enabling a window that does not fit the
    /// frame fails without changing anything.
    pub fn toggle_partial_field(&mut self) -> ScanResult<()> {
        let enable = !self.window_enabled;
        if enable {
            self.window.validate(self.shared.field().resolution)?;
        }
        self.window_enabled = enable;
        info!(enabled = enable, window = ?self.window, "partial field toggled");
        self.restart_with_window()?;
        self.redraw_overlay();
        Ok(())
    }

    /// Nudge the partial field by half its size and restart in continuous mode.
    ///
    /// Returns `false` without restarting when no window is enabled or the move
    /// would leave the frame.
    pub fn move_partial_field(&mut self, direction: Direction) -> ScanResult<bool> {
        if !self.window_enabled {
            return Ok(false);
        }
        let resolution = self.shared.field().resolution;
        let Some(next) = self.window.moved(direction, resolution) else {
            debug!(?direction, window = ?self.window, "partial field move refused");
            return Ok(false);
        };
        self.window = next;
        info!(?direction, x = next.x, y = next.y, "partial field moved");
        self.restart_with_window()?;
        self.redraw_overlay();
        Ok(true)
    }

    /// Change the detector gain without restarting.
    ///
    /// A running continuous scan applies it from the next frame.
    pub fn set_gain(&mut self, gain: i16) -> ScanResult<()> {
        if gain <= 0 {
            return Err(ScanError::config(format!("gain {gain} must be positive")));
        }
        let mut field = self.shared.field();
        field.gain = gain;
        self.shared.update_field(field)?;
        info!(gain, "gain updated");
        Ok(())
    }

    /// Current state, reaping a loop that has exited on its own.
    pub fn status(&mut self) -> ScanStatus {
        self.reap();
        let state = self.shared.lock();
        ScanStatus {
            mode: state.mode,
            resolution: state.field.resolution,
            window: state.field.window,
            gain: state.field.gain,
            loop_alive: self.handle.is_some(),
            frames_completed: self.shared.frames_completed(),
        }
    }

    /// The window, when enabled, as the overlay the display should draw.
    pub fn overlay(&self) -> Option<PartialField> {
        self.window_enabled.then_some(self.window)
    }

    /// The most recent loop failure, if not yet taken.
    pub fn last_error(&mut self) -> Option<&ScanError> {
        self.reap();
        self.last_error.as_ref()
    }

    /// Take the most recent loop failure.
    pub fn take_last_error(&mut self) -> Option<ScanError> {
        self.reap();
        self.last_error.take()
    }

    /// Copy of the intensity map.
    pub fn snapshot(&self) -> FrameBuffer {
        self.shared.snapshot()
    }

    /// Write the raw intensity map to `path`.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> ScanResult<()> {
        export::save_tiff(&self.snapshot(), path)
    }

    /// Stop and block until the loop has terminated.
    ///
    /// Returns the error of the final activation, if it failed and the failure was
    /// not already taken.
    pub fn quit(&mut self) -> ScanResult<()> {
        self.halt();
        match self.last_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn restart_with_window(&mut self) -> ScanResult<()> {
        self.halt();
        let mut field = self.shared.field();
        field.window = self.overlay();
        self.shared.update_field(field)?;
        self.launch(ScanMode::Continuous)
    }

    /// Steps 1 and 2 of the handshake. Loop failures are kept in `last_error`.
    fn halt(&mut self) -> Option<ScanReport> {
        self.shared.request_stop();
        let handle = self.handle.take()?;
        let started = Instant::now();
        let result = handle.wait(self.timing.stop_poll);
        debug!(
            waited_ms = started.elapsed().as_millis() as u64,
            "previous scan terminated"
        );
        self.absorb(result)
    }

    fn launch(&mut self, mode: ScanMode) -> ScanResult<()> {
        self.reap();
        if self.handle.is_some() {
            return Err(ScanError::ConcurrencyViolation);
        }
        let handle = self.engine.clone().start(Arc::clone(&self.shared), mode)?;
        self.handle = Some(handle);
        Ok(())
    }

    fn reap(&mut self) {
        if self.handle.as_ref().is_some_and(LoopHandle::is_finished) {
            if let Some(handle) = self.handle.take() {
                let result = handle.join();
                self.absorb(result);
            }
        }
    }

    fn absorb(&mut self, result: ScanResult<ScanReport>) -> Option<ScanReport> {
        match result {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "scan ended with error");
                self.last_error = Some(e);
                None
            }
        }
    }

    fn redraw_overlay(&self) {
        if let Some(sink) = &self.display {
            let frame = DisplayFrame::from_buffer(&self.shared.snapshot());
            sink.present_overlay(&frame, self.overlay());
        }
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.shared.request_stop();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                warn!(error = %e, "scan ended with error during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::RecordingPort;
    use tracing_test::traced_test;

    fn fast_settings() -> Settings {
        let mut settings = Settings::with_default_presets();
        settings.scan.stop_poll_ms = 2;
        settings.scan.restart_pause_ms = 0;
        settings.scan.frame_pause_ms = 1;
        settings.scan.initial_resolution = 128;
        settings.partial_field.size = 32;
        settings
    }

    fn controller() -> (Arc<RecordingPort>, ScanController) {
        let settings = fast_settings();
        let port = Arc::new(RecordingPort::new(settings.wiring));
        let ctrl = ScanController::new(port.clone(), &settings).unwrap();
        (port, ctrl)
    }

    #[test]
    fn starts_idle() {
        let (port, mut ctrl) = controller();
        let status = ctrl.status();
        assert_eq!(status.mode, ScanMode::Idle);
        assert!(!status.loop_alive);
        assert_eq!(port.write_count(), 0);
    }

    #[test]
    fn unknown_preset_is_rejected_without_side_effects() {
        let (_port, mut ctrl) = controller();
        let err = ctrl.select_preset(9).unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
        assert_eq!(ctrl.mode(), ScanMode::Idle);
    }

    #[test]
    fn preset_reallocates_and_runs_continuous() {
        let (_port, mut ctrl) = controller();
        ctrl.select_preset(2).unwrap();
        let status = ctrl.status();
        assert_eq!(status.mode, ScanMode::Continuous);
        assert_eq!(status.resolution, Resolution::square(256).unwrap());
        assert_eq!(status.gain, 5);
        assert_eq!(ctrl.snapshot().as_slice().len(), 256 * 256);
        ctrl.quit().unwrap();
        assert!(!ctrl.status().loop_alive);
    }

    #[test]
    fn stop_is_idempotent() {
        let (_port, mut ctrl) = controller();
        ctrl.stop();
        ctrl.stop();
        ctrl.toggle_run().unwrap();
        assert_eq!(ctrl.mode(), ScanMode::Continuous);
        ctrl.toggle_run().unwrap();
        ctrl.stop();
        assert_eq!(ctrl.mode(), ScanMode::Idle);
        ctrl.quit().unwrap();
    }

    #[test]
    fn window_move_requires_enabled_window() {
        let (_port, mut ctrl) = controller();
        assert!(!ctrl.move_partial_field(Direction::North).unwrap());
        ctrl.toggle_partial_field().unwrap();
        assert!(ctrl.move_partial_field(Direction::North).unwrap());
        assert_eq!(ctrl.overlay().map(|w| (w.x, w.y)), Some((48, 32)));
        assert_eq!(ctrl.status().window, ctrl.overlay());
    }

    #[test]
    fn preset_change_disables_and_recentres_window() {
        let (_port, mut ctrl) = controller();
        ctrl.toggle_partial_field().unwrap();
        ctrl.move_partial_field(Direction::East).unwrap();
        ctrl.select_preset(2).unwrap();
        assert_eq!(ctrl.overlay(), None);
        assert_eq!(ctrl.status().window, None);

        ctrl.toggle_partial_field().unwrap();
        assert_eq!(ctrl.overlay().map(|w| (w.x, w.y)), Some((112, 112)));
        ctrl.quit().unwrap();
    }

    #[test]
    fn oversized_window_cannot_be_enabled() {
        let mut settings = fast_settings();
        settings.partial_field.size = 256;
        let port = Arc::new(RecordingPort::new(settings.wiring));
        let mut ctrl = ScanController::new(port, &settings).unwrap();

        assert!(matches!(
            ctrl.toggle_partial_field(),
            Err(ScanError::Configuration(_))
        ));
        assert_eq!(ctrl.overlay(), None);
    }

    #[test]
    fn rejects_non_positive_gain() {
        let (_port, mut ctrl) = controller();
        assert!(ctrl.set_gain(0).is_err());
        ctrl.set_gain(10).unwrap();
        assert_eq!(ctrl.status().gain, 10);
    }

    #[test]
    #[traced_test]
    fn preset_selection_and_moves_are_logged() {
        let (_port, mut ctrl) = controller();
        ctrl.toggle_partial_field().unwrap();
        ctrl.move_partial_field(Direction::West).unwrap();
        ctrl.select_preset(1).unwrap();
        ctrl.quit().unwrap();

        assert!(logs_contain("partial field moved"));
        assert!(logs_contain("scan rate selected"));
    }

    #[test]
    #[traced_test]
    fn drop_logs_error_of_final_loop() {
        let (port, mut ctrl) = controller();
        port.fail_on_write(10);
        ctrl.select_preset(1).unwrap();

        let shared = ctrl.shared();
        let started = Instant::now();
        while shared.is_active() {
            assert!(started.elapsed() < Duration::from_secs(10));
            thread::sleep(Duration::from_millis(1));
        }
        drop(ctrl);

        assert!(logs_contain("scan ended with error during shutdown"));
        assert!(logs_contain("injected failure on write 10"));
    }
}
