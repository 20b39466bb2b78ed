//! Scan Field Descriptor
//!
//! Pure data describing what a raster pass covers: the full-frame resolution, an
//! optional partial field (sub-window) and the settings captured by an activation.

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Largest supported frame edge in pixels.
pub const MAX_RESOLUTION: u32 = 4096;

/// Full-frame resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    /// Number of columns (X axis).
    pub width: u32,
    /// Number of rows (Y axis).
    pub height: u32,
}

impl Resolution {
    /// Create a resolution, rejecting zero or oversized edges.
    pub fn new(width: u32, height: u32) -> ScanResult<Self> {
        for (axis, n) in [("width", width), ("height", height)] {
            if n == 0 || n > MAX_RESOLUTION {
                return Err(ScanError::config(format!(
                    "{axis} {n} outside 1..={MAX_RESOLUTION}"
                )));
            }
        }
        Ok(Self { width, height })
    }

    /// Square frame, the only shape the presets use.
    pub fn square(n: u32) -> ScanResult<Self> {
        Self::new(n, n)
    }

    /// Number of pixels in the full frame.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Direction of a partial field nudge. North is towards row 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards row 0.
    North,
    /// Towards the last row.
    South,
    /// Towards the last column.
    East,
    /// Towards column 0.
    West,
}

/// Square sub-window of the frame scanned instead of the full field.
///
/// The size is fixed for the life of the window; the origin moves in steps of half
/// the size and never leaves the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialField {
    /// First column of the window.
    pub x: u32,
    /// First row of the window.
    pub y: u32,
    /// Edge length in pixels.
    pub size: u32,
}

impl PartialField {
    /// Window of `size` centred in `resolution`.
    ///
    /// Half-pixel offsets round to even. If the window does not fit, the origin on
    /// that axis is 0 and `validate` will reject it.
    pub fn centered(resolution: Resolution, size: u32) -> Self {
        let centre = |n: u32| (f64::from(n.saturating_sub(size)) / 2.0).round_ties_even() as u32;
        Self {
            x: centre(resolution.width),
            y: centre(resolution.height),
            size,
        }
    }

    /// Check the window lies inside `[0, width) x [0, height)`.
    pub fn validate(&self, resolution: Resolution) -> ScanResult<()> {
        if self.size == 0 {
            return Err(ScanError::config("partial field size must be positive"));
        }
        if self.size > resolution.width || self.size > resolution.height {
            return Err(ScanError::config(format!(
                "partial field {} exceeds frame {resolution}",
                self.size
            )));
        }
        if self.x + self.size > resolution.width || self.y + self.size > resolution.height {
            return Err(ScanError::config(format!(
                "partial field at ({}, {}) size {} leaves frame {resolution}",
                self.x, self.y, self.size
            )));
        }
        Ok(())
    }

    /// Distance covered by one nudge.
    pub fn step(&self) -> u32 {
        self.size / 2
    }

    /// The window moved one step in `direction`, or `None` if it would leave the frame.
    pub fn moved(&self, direction: Direction, resolution: Resolution) -> Option<Self> {
        let step = self.step();
        if step == 0 {
            return None;
        }
        let mut next = *self;
        match direction {
            Direction::North => next.y = self.y.checked_sub(step)?,
            Direction::West => next.x = self.x.checked_sub(step)?,
            Direction::South => next.y = self.y + step,
            Direction::East => next.x = self.x + step,
        }
        next.validate(resolution).ok().map(|()| next)
    }

    /// Same window with its origin pulled back inside `resolution`.
    pub fn clamped(&self, resolution: Resolution) -> Self {
        Self {
            x: self.x.min(resolution.width.saturating_sub(self.size)),
            y: self.y.min(resolution.height.saturating_sub(self.size)),
            size: self.size,
        }
    }

    /// Columns covered by the window.
    pub fn cols(&self) -> Range<u32> {
        self.x..self.x + self.size
    }

    /// Rows covered by the window.
    pub fn rows(&self) -> Range<u32> {
        self.y..self.y + self.size
    }

    /// Whether the pixel at `(row, col)` is inside the window.
    pub fn contains(&self, row: u32, col: u32) -> bool {
        self.rows().contains(&row) && self.cols().contains(&col)
    }
}

/// Inclusive range of device codes spanned by a deflection axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeRange {
    /// Code written for the first pixel.
    pub min: i16,
    /// Code written for the last pixel.
    pub max: i16,
}

impl Default for CodeRange {
    fn default() -> Self {
        Self {
            min: -2048,
            max: 2047,
        }
    }
}

/// Everything an activation of the acquisition loop needs to know about the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanField {
    /// Full-frame resolution; the frame buffer is allocated to match.
    pub resolution: Resolution,
    /// Partial field, when enabled.
    pub window: Option<PartialField>,
    /// Gain passed to every detector read.
    pub gain: i16,
    /// Deflection code range.
    pub codes: CodeRange,
}

impl ScanField {
    /// Full-field descriptor with the default code range.
    pub fn new(resolution: Resolution, gain: i16) -> Self {
        Self {
            resolution,
            window: None,
            gain,
            codes: CodeRange::default(),
        }
    }

    /// Attach a partial field.
    pub fn with_window(mut self, window: Option<PartialField>) -> Self {
        self.window = window;
        self
    }

    /// Override the deflection code range.
    pub fn with_codes(mut self, codes: CodeRange) -> Self {
        self.codes = codes;
        self
    }

    /// Reject combinations the raster generator cannot serve.
    pub fn validate(&self) -> ScanResult<()> {
        Resolution::new(self.resolution.width, self.resolution.height)?;
        if self.codes.min >= self.codes.max {
            return Err(ScanError::config(format!(
                "code range {}..={} is empty",
                self.codes.min, self.codes.max
            )));
        }
        if let Some(window) = &self.window {
            window.validate(self.resolution)?;
        }
        Ok(())
    }
}
