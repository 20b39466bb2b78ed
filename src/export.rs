//! Export collaborator
//!
//! Serialises the raw intensity map as a single-channel 16-bit TIFF. There is one
//! fixed encoding: each signed sample is stored offset-binary (`sample + 32768`), so
//! the full `i16` range round-trips without loss.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use image::{ImageBuffer, ImageFormat, Luma};
use tracing::info;

use crate::error::{ScanError, ScanResult};
use crate::scan::field::Resolution;
use crate::scan::frame::FrameBuffer;

const OFFSET: i32 = 32768;

fn encode(sample: i16) -> u16 {
    (i32::from(sample) + OFFSET) as u16
}

fn decode(value: u16) -> i16 {
    (i32::from(value) - OFFSET) as i16
}

/// Write `frame` to `path` as a 16-bit grayscale TIFF.
pub fn save_tiff(frame: &FrameBuffer, path: impl AsRef<Path>) -> ScanResult<()> {
    let path = path.as_ref();
    let resolution = frame.resolution();
    let samples: Vec<u16> = frame.as_slice().iter().map(|v| encode(*v)).collect();
    let image: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(resolution.width, resolution.height, samples)
            .ok_or_else(|| ScanError::config("frame buffer does not match its resolution"))?;
    image.save_with_format(path, ImageFormat::Tiff)?;
    info!(path = %path.display(), %resolution, "intensity map saved");
    Ok(())
}

/// Read a TIFF written by `save_tiff` back into a frame buffer.
pub fn load_tiff(path: impl AsRef<Path>) -> ScanResult<FrameBuffer> {
    let image = image::open(path.as_ref())?.into_luma16();
    let resolution = Resolution::new(image.width(), image.height())?;
    let samples = image.into_raw().into_iter().map(decode).collect();
    FrameBuffer::from_samples(resolution, samples)
}

/// `dir/scan_YYYYmmdd_HHMMSS.tif` for the given time.
pub fn timestamped_path(dir: impl AsRef<Path>, at: DateTime<Local>) -> PathBuf {
    dir.as_ref()
        .join(format!("scan_{}.tif", at.format("%Y%m%d_%H%M%S")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn offset_binary_is_lossless() {
        for v in [i16::MIN, -2048, -1, 0, 1, 2047, i16::MAX] {
            assert_eq!(decode(encode(v)), v);
        }
        assert_eq!(encode(0), 32768);
    }

    #[test]
    fn saved_map_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.tif");
        let mut frame = FrameBuffer::new(Resolution::new(5, 3).unwrap());
        frame.set(0, 0, -2048);
        frame.set(2, 4, 2047);
        frame.set(1, 2, -7);

        save_tiff(&frame, &path).unwrap();
        let loaded = load_tiff(&path).unwrap();

        assert_eq!(loaded, frame);
    }

    #[test]
    fn save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("map.tif");
        let frame = FrameBuffer::new(Resolution::square(4).unwrap());
        assert!(save_tiff(&frame, &path).is_err());
    }

    #[test]
    fn timestamped_names() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = timestamped_path("/data", at);
        assert_eq!(path, PathBuf::from("/data/scan_20240309_140507.tif"));
    }
}
