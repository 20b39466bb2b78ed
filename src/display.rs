//! Display collaborator
//!
//! Turns the shared frame buffer into something presentable:
//!
//! - `DisplayFrame::from_buffer` applies the fixed linear rescale
//!   `(sample + 2048) / 16` to an 8-bit grey image
//! - `DisplayFrame::to_rgb_with_overlay` draws the partial field outline
//! - `DisplayRefresher` presents a fresh snapshot on a fixed interval, independent of
//!   the acquisition rate
//!
//! The refresher reads through `ScanShared::snapshot`, which takes the same lock the
//! acquisition loop uses for each cell. A presented image is therefore never torn
//! within a cell, but can show a raster that is only partly updated.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{GrayImage, RgbImage};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scan::field::PartialField;
use crate::scan::frame::{FrameBuffer, ScanShared};

/// Offset added to a sample before scaling.
pub const DISPLAY_OFFSET: i32 = 2048;
/// Divisor applied after the offset.
pub const DISPLAY_DIVISOR: i32 = 16;
/// Overlay outline thickness in pixels.
pub const OVERLAY_THICKNESS: u32 = 5;

/// Rescale one sample to 8 bits.
pub fn rescale(sample: i16) -> u8 {
    ((i32::from(sample) + DISPLAY_OFFSET) / DISPLAY_DIVISOR).clamp(0, 255) as u8
}

/// 8-bit grey image ready for presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// Row-major grey levels.
    pub pixels: Vec<u8>,
}

impl DisplayFrame {
    /// Rescale a frame buffer.
    pub fn from_buffer(frame: &FrameBuffer) -> Self {
        let resolution = frame.resolution();
        Self {
            width: resolution.width,
            height: resolution.height,
            pixels: frame.as_slice().iter().map(|v| rescale(*v)).collect(),
        }
    }

    /// Mean grey level, for logging.
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        let sum: u64 = self.pixels.iter().map(|p| u64::from(*p)).sum();
        sum as f64 / self.pixels.len() as f64
    }

    /// Interleaved RGB copy with the window outline drawn in the green channel.
    ///
    /// The outline sits just outside the window and is clipped to the frame.
    pub fn to_rgb_with_overlay(&self, window: Option<PartialField>) -> Vec<u8> {
        let mut rgb: Vec<u8> = self.pixels.iter().flat_map(|p| [*p, *p, *p]).collect();
        let Some(w) = window else {
            return rgb;
        };
        let t = OVERLAY_THICKNESS;
        let outer_rows = w.y.saturating_sub(t)..(w.y + w.size + t).min(self.height);
        let outer_cols = w.x.saturating_sub(t)..(w.x + w.size + t).min(self.width);
        for row in outer_rows {
            for col in outer_cols.clone() {
                if w.contains(row, col) {
                    continue;
                }
                let i = (row as usize * self.width as usize + col as usize) * 3 + 1;
                rgb[i] = 255;
            }
        }
        rgb
    }
}

/// Receives rendered frames. Implementations use interior mutability.
pub trait DisplaySink: Send + Sync {
    /// Present the latest frame.
    fn present_frame(&self, frame: &DisplayFrame);

    /// Redraw the partial field overview; `None` clears the outline.
    fn present_overlay(&self, frame: &DisplayFrame, window: Option<PartialField>);
}

/// Sink that logs frame statistics and optionally writes PNG previews.
#[derive(Debug, Default)]
pub struct LoggingSink {
    preview: Option<PathBuf>,
    overlay_preview: Option<PathBuf>,
    presented: AtomicU64,
}

impl LoggingSink {
    /// Sink that only logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also write each frame to `path` (PNG), and the overlay view next to it.
    pub fn with_preview(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.overlay_preview = Some(path.with_extension("overlay.png"));
        self.preview = Some(path);
        self
    }

    /// Frames presented so far.
    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::SeqCst)
    }
}

impl DisplaySink for LoggingSink {
    fn present_frame(&self, frame: &DisplayFrame) {
        let n = self.presented.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(frame = n, mean = frame.mean(), "display refresh");
        if let Some(path) = &self.preview {
            let saved = GrayImage::from_raw(frame.width, frame.height, frame.pixels.clone())
                .map(|img| img.save(path));
            if let Some(Err(e)) = saved {
                warn!(error = %e, path = %path.display(), "preview write failed");
            }
        }
    }

    fn present_overlay(&self, frame: &DisplayFrame, window: Option<PartialField>) {
        info!(?window, "partial field overlay");
        if let Some(path) = &self.overlay_preview {
            let rgb = frame.to_rgb_with_overlay(window);
            let saved = RgbImage::from_raw(frame.width, frame.height, rgb).map(|img| img.save(path));
            if let Some(Err(e)) = saved {
                warn!(error = %e, path = %path.display(), "overlay write failed");
            }
        }
    }
}

/// Periodic display refresh task.
pub struct DisplayRefresher {
    shared: Arc<ScanShared>,
    sink: Arc<dyn DisplaySink>,
    interval: Duration,
    enabled: bool,
}

impl DisplayRefresher {
    /// Refresh `sink` from `shared` every `interval`.
    pub fn new(shared: Arc<ScanShared>, sink: Arc<dyn DisplaySink>, interval: Duration) -> Self {
        Self {
            shared,
            sink,
            interval,
            enabled: true,
        }
    }

    /// Start with refresh disabled.
    pub fn start_disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Spawn the refresh loop on the current tokio runtime.
    pub fn spawn(self) -> RefreshHandle {
        let enabled = Arc::new(AtomicBool::new(self.enabled));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let flag = Arc::clone(&enabled);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            let mut presented = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if flag.load(Ordering::SeqCst) {
                            let frame = DisplayFrame::from_buffer(&self.shared.snapshot());
                            self.sink.present_frame(&frame);
                            presented += 1;
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            presented
        });
        RefreshHandle {
            enabled,
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Control handle for a running refresher.
pub struct RefreshHandle {
    enabled: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl RefreshHandle {
    /// Flip refresh on/off; returns the new state. Acquisition is unaffected.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Whether frames are being presented.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Stop the task; returns the number of frames presented.
    pub async fn shutdown(mut self) -> u64 {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.task).await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::field::{Resolution, ScanField};
    use std::sync::Mutex;

    #[test]
    fn rescale_maps_device_range_to_bytes() {
        assert_eq!(rescale(-2048), 0);
        assert_eq!(rescale(0), 128);
        assert_eq!(rescale(2047), 255);
        assert_eq!(rescale(-3000), 0);
        assert_eq!(rescale(i16::MAX), 255);
    }

    #[test]
    fn overlay_outline_surrounds_window() {
        let mut buf = FrameBuffer::new(Resolution::square(64).unwrap());
        buf.set(0, 0, -2048);
        let frame = DisplayFrame::from_buffer(&buf);
        let window = PartialField { x: 16, y: 16, size: 32 };
        let rgb = frame.to_rgb_with_overlay(Some(window));
        let green = |row: usize, col: usize| rgb[(row * 64 + col) * 3 + 1];

        assert_eq!(green(11, 11), 255);
        assert_eq!(green(15, 30), 255);
        assert_eq!(green(48, 52), 255);
        assert_eq!(green(20, 20), 128);
        assert_eq!(green(10, 30), 128);
        assert_eq!(rgb[0], 0);
    }

    #[test]
    fn overlay_is_clipped_at_frame_edge() {
        let frame = DisplayFrame::from_buffer(&FrameBuffer::new(Resolution::square(32).unwrap()));
        let window = PartialField { x: 0, y: 0, size: 32 };
        let rgb = frame.to_rgb_with_overlay(Some(window));
        assert!(rgb.chunks(3).all(|px| px[1] == 128));
    }

    #[derive(Default)]
    struct CountingSink {
        frames: Mutex<Vec<f64>>,
    }

    impl DisplaySink for CountingSink {
        fn present_frame(&self, frame: &DisplayFrame) {
            self.frames.lock().unwrap().push(frame.mean());
        }

        fn present_overlay(&self, _frame: &DisplayFrame, _window: Option<PartialField>) {}
    }

    #[tokio::test]
    async fn refresher_presents_until_shutdown() {
        let field = ScanField::new(Resolution::square(8).unwrap(), 1);
        let shared = Arc::new(ScanShared::new(field).unwrap());
        let sink = Arc::new(CountingSink::default());

        let handle =
            DisplayRefresher::new(shared, sink.clone(), Duration::from_millis(5)).spawn();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let presented = handle.shutdown().await;

        assert!(presented >= 2, "presented {presented}");
        assert_eq!(sink.frames.lock().unwrap().len() as u64, presented);
    }

    #[tokio::test]
    async fn disabled_refresher_presents_nothing() {
        let field = ScanField::new(Resolution::square(8).unwrap(), 1);
        let shared = Arc::new(ScanShared::new(field).unwrap());
        let sink = Arc::new(CountingSink::default());

        let handle = DisplayRefresher::new(shared, sink.clone(), Duration::from_millis(5))
            .start_disabled()
            .spawn();
        assert!(!handle.is_enabled());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.toggle());
        assert_eq!(handle.shutdown().await as usize, sink.frames.lock().unwrap().len());
    }
}
