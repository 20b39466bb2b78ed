//! Shared Frame Buffer
//!
//! The intensity map and the state guarding it. One mutex covers the scan mode, the
//! active field and the buffer:
//!
//! - The acquisition loop holds it only to check the mode, to store one cell, and to
//!   perform the single-pass self-stop.
//! - The display/export path takes it to copy a snapshot, so a snapshot is never torn
//!   mid-cell, though it may show a partially completed raster.
//! - Reallocation happens only while no loop is active.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ScanError, ScanResult};
use crate::scan::field::{Resolution, ScanField};
use crate::scan::mode::ScanMode;

/// Row-major grid of signed detector samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    data: Vec<i16>,
}

impl FrameBuffer {
    /// Zero-filled buffer for `resolution`.
    pub fn new(resolution: Resolution) -> Self {
        Self {
            width: resolution.width,
            height: resolution.height,
            data: vec![0; resolution.pixel_count()],
        }
    }

    /// Buffer from row-major samples; the length must match `resolution`.
    pub fn from_samples(resolution: Resolution, data: Vec<i16>) -> ScanResult<Self> {
        if data.len() != resolution.pixel_count() {
            return Err(ScanError::config(format!(
                "{} samples do not fill a {resolution} frame",
                data.len()
            )));
        }
        Ok(Self {
            width: resolution.width,
            height: resolution.height,
            data,
        })
    }

    /// Buffer dimensions.
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }

    fn index(&self, row: u32, col: u32) -> Option<usize> {
        (row < self.height && col < self.width)
            .then(|| row as usize * self.width as usize + col as usize)
    }

    /// Sample at `(row, col)`.
    pub fn get(&self, row: u32, col: u32) -> Option<i16> {
        self.index(row, col).map(|i| self.data[i])
    }

    /// Store a sample; returns `false` if `(row, col)` is outside the frame.
    pub fn set(&mut self, row: u32, col: u32, value: i16) -> bool {
        match self.index(row, col) {
            Some(i) => {
                self.data[i] = value;
                true
            }
            None => false,
        }
    }

    /// Samples in row-major order.
    pub fn as_slice(&self) -> &[i16] {
        &self.data
    }
}

/// State behind the shared lock.
#[derive(Debug)]
pub struct ScanState {
    /// Current mode; written by the controller and by the loop's self-stop.
    pub mode: ScanMode,
    /// Field the next outer iteration of the loop will scan.
    pub field: ScanField,
    /// Intensity map.
    pub frame: FrameBuffer,
}

/// Lock container shared by the controller, the acquisition loop and the display path.
#[derive(Debug)]
pub struct ScanShared {
    state: Mutex<ScanState>,
    active: AtomicBool,
    frames_completed: AtomicU64,
}

impl ScanShared {
    /// Idle state with a zeroed buffer for `field`.
    pub fn new(field: ScanField) -> ScanResult<Self> {
        field.validate()?;
        Ok(Self {
            state: Mutex::new(ScanState {
                mode: ScanMode::Idle,
                frame: FrameBuffer::new(field.resolution),
                field,
            }),
            active: AtomicBool::new(false),
            frames_completed: AtomicU64::new(0),
        })
    }

    /// Acquire the shared lock.
    ///
    /// A panic on another thread cannot leave the state half-updated (every critical
    /// section is a single assignment), so a poisoned lock is recovered.
    pub fn lock(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current mode.
    pub fn mode(&self) -> ScanMode {
        self.lock().mode
    }

    /// Set the mode, returning the previous one.
    pub fn set_mode(&self, mode: ScanMode) -> ScanMode {
        std::mem::replace(&mut self.lock().mode, mode)
    }

    /// Ask a running loop to stop at its next check. Never blocks on the loop.
    pub fn request_stop(&self) -> ScanMode {
        self.set_mode(ScanMode::Idle)
    }

    /// Single-pass self-stop: `SinglePass` becomes `Idle`. Returns the mode after.
    pub fn finish_pass(&self) -> ScanMode {
        let mut state = self.lock();
        if state.mode == ScanMode::SinglePass {
            state.mode = ScanMode::Idle;
        }
        state.mode
    }

    /// Field the next outer iteration will use.
    pub fn field(&self) -> ScanField {
        self.lock().field
    }

    /// Replace the field and reallocate a zeroed buffer.
    ///
    /// Refused while a loop is active, since that loop may still be writing cells.
    pub fn reconfigure(&self, field: ScanField) -> ScanResult<()> {
        field.validate()?;
        if self.is_active() {
            return Err(ScanError::ConcurrencyViolation);
        }
        let mut state = self.lock();
        state.frame = FrameBuffer::new(field.resolution);
        state.field = field;
        Ok(())
    }

    /// Replace the field without touching the buffer.
    ///
    /// A running loop picks the change up at its next frame boundary. The resolution
    /// must match the current buffer.
    pub fn update_field(&self, field: ScanField) -> ScanResult<()> {
        field.validate()?;
        let mut state = self.lock();
        if field.resolution != state.frame.resolution() {
            return Err(ScanError::config(format!(
                "resolution {} differs from buffer {}; reconfigure instead",
                field.resolution,
                state.frame.resolution()
            )));
        }
        state.field = field;
        Ok(())
    }

    /// Store one sample. The lock is held for this cell only.
    pub fn store(&self, row: u32, col: u32, value: i16) -> bool {
        self.lock().frame.set(row, col, value)
    }

    /// Consistent copy of the buffer.
    pub fn snapshot(&self) -> FrameBuffer {
        self.lock().frame.clone()
    }

    /// Whether an acquisition loop currently holds the active claim.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim the single acquisition-loop slot.
    pub(crate) fn claim(self: &Arc<Self>) -> ScanResult<ActiveClaim> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ActiveClaim(Arc::clone(self)))
            .map_err(|_| ScanError::ConcurrencyViolation)
    }

    /// Full passes completed since creation.
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_frame(&self) -> u64 {
        self.frames_completed.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Held by a running loop; releases the slot on drop, including on panic.
pub(crate) struct ActiveClaim(Arc<ScanShared>);

impl ActiveClaim {
    pub(crate) fn shared(&self) -> &Arc<ScanShared> {
        &self.0
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        self.0.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(n: u32) -> Arc<ScanShared> {
        Arc::new(ScanShared::new(ScanField::new(Resolution::square(n).unwrap(), 1)).unwrap())
    }

    #[test]
    fn buffer_starts_zeroed() {
        let buf = FrameBuffer::new(Resolution::new(4, 3).unwrap());
        assert_eq!(buf.as_slice().len(), 12);
        assert!(buf.as_slice().iter().all(|v| *v == 0));
    }

    #[test]
    fn set_is_row_major_and_bounds_checked() {
        let mut buf = FrameBuffer::new(Resolution::new(4, 3).unwrap());
        assert!(buf.set(1, 2, 42));
        assert_eq!(buf.as_slice()[6], 42);
        assert_eq!(buf.get(1, 2), Some(42));
        assert!(!buf.set(3, 0, 1));
        assert_eq!(buf.get(0, 4), None);
    }

    #[test]
    fn single_pass_self_stop() {
        let s = shared(8);
        s.set_mode(ScanMode::SinglePass);
        assert_eq!(s.finish_pass(), ScanMode::Idle);

        s.set_mode(ScanMode::Continuous);
        assert_eq!(s.finish_pass(), ScanMode::Continuous);
    }

    #[test]
    fn reconfigure_reallocates_and_is_refused_while_active() {
        let s = shared(8);
        s.store(0, 0, 7);
        let field = ScanField::new(Resolution::square(16).unwrap(), 1);

        let claim = s.claim().unwrap();
        assert!(matches!(s.claim(), Err(ScanError::ConcurrencyViolation)));
        assert!(matches!(
            s.reconfigure(field),
            Err(ScanError::ConcurrencyViolation)
        ));
        drop(claim);

        s.reconfigure(field).unwrap();
        let snap = s.snapshot();
        assert_eq!(snap.resolution(), Resolution::square(16).unwrap());
        assert_eq!(snap.get(0, 0), Some(0));
    }

    #[test]
    fn live_update_keeps_buffer() {
        let s = shared(8);
        s.store(1, 1, 5);
        let mut field = s.field();
        field.gain = 10;
        s.update_field(field).unwrap();
        assert_eq!(s.field().gain, 10);
        assert_eq!(s.snapshot().get(1, 1), Some(5));

        field.resolution = Resolution::square(16).unwrap();
        assert!(s.update_field(field).is_err());
    }
}
