//! Raster Coordinate Generator
//!
//! Turns a scan field into the row/column ranges to traverse and the per-axis
//! deflection code tables. Code tables always cover the full resolution; a partial
//! field only narrows the traversal ranges.

use std::ops::Range;
use std::sync::Arc;

use crate::error::{ScanError, ScanResult};
use crate::scan::field::{CodeRange, PartialField, Resolution, ScanField};

/// Deflection codes for an axis of `n` pixels.
///
/// Linear interpolation from `range.min` to `range.max`, rounded half-to-even.
/// The last element is exactly `range.max`; a single-pixel axis sits at `range.min`.
pub fn axis_codes(n: u32, range: CodeRange) -> Vec<i16> {
    if n <= 1 {
        return vec![range.min; n as usize];
    }
    let start = f64::from(range.min);
    let step = (f64::from(range.max) - start) / f64::from(n - 1);
    let mut codes: Vec<i16> = (0..n)
        .map(|k| (start + f64::from(k) * step).round_ties_even() as i16)
        .collect();
    if let Some(last) = codes.last_mut() {
        *last = range.max;
    }
    codes
}

/// Visit order and code tables for one raster pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterPlan {
    /// Rows to traverse, in increasing order.
    pub rows: Range<u32>,
    /// Columns to traverse within each row, in increasing order.
    pub cols: Range<u32>,
    /// X code for every column of the full frame.
    pub x_codes: Vec<i16>,
    /// Y code for every row of the full frame.
    pub y_codes: Vec<i16>,
}

impl RasterPlan {
    /// Build the plan for a resolution and optional partial field.
    ///
    /// The window origin is clamped into the frame. A window larger than the frame
    /// is a configuration error.
    pub fn build(
        resolution: Resolution,
        window: Option<&PartialField>,
        codes: CodeRange,
    ) -> ScanResult<Self> {
        let (rows, cols) = match window {
            None => (0..resolution.height, 0..resolution.width),
            Some(w) => {
                if w.size == 0 || w.size > resolution.width || w.size > resolution.height {
                    return Err(ScanError::config(format!(
                        "partial field {} does not fit frame {resolution}",
                        w.size
                    )));
                }
                let w = w.clamped(resolution);
                (w.rows(), w.cols())
            }
        };
        Ok(Self {
            rows,
            cols,
            x_codes: axis_codes(resolution.width, codes),
            y_codes: axis_codes(resolution.height, codes),
        })
    }

    /// Build the plan for a scan field.
    pub fn for_field(field: &ScanField) -> ScanResult<Self> {
        Self::build(field.resolution, field.window.as_ref(), field.codes)
    }

    /// Number of pixels visited by one pass.
    pub fn point_count(&self) -> usize {
        self.rows.len() * self.cols.len()
    }

    #[cfg(test)]
    fn points(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.rows
            .clone()
            .flat_map(move |row| self.cols.clone().map(move |col| (row, col)))
    }
}

type PlanKey = (Resolution, Option<PartialField>, CodeRange);

/// Keeps the last plan and rebuilds only when resolution, window or code range change.
#[derive(Debug, Default)]
pub struct RasterCache {
    entry: Option<(PlanKey, Arc<RasterPlan>)>,
    builds: usize,
}

impl RasterCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan for `field`, reusing the cached one when its key is unchanged.
    pub fn plan_for(&mut self, field: &ScanField) -> ScanResult<Arc<RasterPlan>> {
        let key = (field.resolution, field.window, field.codes);
        if let Some((cached, plan)) = &self.entry {
            if *cached == key {
                return Ok(Arc::clone(plan));
            }
        }
        let plan = Arc::new(RasterPlan::for_field(field)?);
        self.builds += 1;
        self.entry = Some((key, Arc::clone(&plan)));
        Ok(plan)
    }

    /// Number of plans built so far.
    pub fn builds(&self) -> usize {
        self.builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRESETS: [u32; 5] = [128, 256, 512, 1024, 2048];

    #[test]
    fn code_tables_span_device_range() {
        let range = CodeRange::default();
        for n in PRESETS {
            let codes = axis_codes(n, range);
            assert_eq!(codes.len(), n as usize);
            assert_eq!(codes[0], -2048);
            assert_eq!(codes[n as usize - 1], 2047);
            assert!(codes.windows(2).all(|w| w[0] <= w[1]), "not monotonic at {n}");
        }
    }

    #[test]
    fn code_table_matches_linear_interpolation() {
        // 4095 / 127 = 32.244..
        let codes = axis_codes(128, CodeRange::default());
        assert_eq!(&codes[..4], &[-2048, -2016, -1984, -1951]);
        assert_eq!(codes[64], 16);
    }

    #[test]
    fn degenerate_axes() {
        let range = CodeRange::default();
        assert!(axis_codes(0, range).is_empty());
        assert_eq!(axis_codes(1, range), vec![-2048]);
        assert_eq!(axis_codes(2, range), vec![-2048, 2047]);
    }

    #[test]
    fn full_frame_plan() {
        let res = Resolution::square(128).unwrap();
        let plan = RasterPlan::build(res, None, CodeRange::default()).unwrap();
        assert_eq!(plan.rows, 0..128);
        assert_eq!(plan.cols, 0..128);
        assert_eq!(plan.point_count(), 128 * 128);
        let first: Vec<_> = plan.points().take(3).collect();
        assert_eq!(first, vec![(0, 0), (0, 1), (0, 2)]);
    }

    #[test]
    fn windowed_plan_keeps_full_tables() {
        let res = Resolution::square(128).unwrap();
        let window = PartialField::centered(res, 32);
        let plan = RasterPlan::build(res, Some(&window), CodeRange::default()).unwrap();
        assert_eq!(plan.rows, 48..80);
        assert_eq!(plan.cols, 48..80);
        assert_eq!(plan.x_codes.len(), 128);
        assert_eq!(plan.points().next(), Some((48, 48)));
        assert_eq!(plan.points().last(), Some((79, 79)));
    }

    #[test]
    fn window_origin_is_clamped() {
        let res = Resolution::square(128).unwrap();
        let window = PartialField { x: 120, y: 500, size: 32 };
        let plan = RasterPlan::build(res, Some(&window), CodeRange::default()).unwrap();
        assert_eq!(plan.cols, 96..128);
        assert_eq!(plan.rows, 96..128);
    }

    #[test]
    fn oversized_window_fails_fast() {
        let res = Resolution::square(128).unwrap();
        let window = PartialField { x: 0, y: 0, size: 256 };
        let result = RasterPlan::build(res, Some(&window), CodeRange::default());
        assert!(matches!(result, Err(ScanError::Configuration(_))));
    }

    #[test]
    fn cache_rebuilds_only_on_key_change() {
        let res = Resolution::square(128).unwrap();
        let mut cache = RasterCache::new();
        let field = ScanField::new(res, 1);

        let a = cache.plan_for(&field).unwrap();
        let b = cache.plan_for(&ScanField { gain: 10, ..field }).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.builds(), 1);

        let windowed = field.with_window(Some(PartialField::centered(res, 32)));
        let c = cache.plan_for(&windowed).unwrap();
        assert_eq!(c.rows, 48..80);
        assert_eq!(cache.builds(), 2);
    }
}
