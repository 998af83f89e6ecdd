//! Spatio-temporal rasterization of point events.
//!
//! Points are binned on a regular `bins × bins` spatial grid spanning their own
//! extent, and on fixed-width time-of-day bins. Only non-empty cells are
//! emitted, which is the table the crash-count model is fitted on.

use crate::error::{Error, Result};
use crate::utility::{linspace, min_max};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Minutes in a day; time bins never extend past midnight.
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// A regular partition of `[min, max]` into `bins` equal intervals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisBins {
    pub min: f64,
    pub max: f64,
    pub bins: usize,
}

impl AxisBins {
    pub fn new(min: f64, max: f64, bins: usize) -> Self {
        Self { min, max, bins }
    }

    /// Width of one bin. Zero for a degenerate axis.
    pub fn size(&self) -> f64 {
        (self.max - self.min) / self.bins as f64
    }

    /// Bin holding `v`, or `None` if it lies outside `[min, max]`.
    ///
    /// The right edge is inclusive, so `max` lands in the last bin. On a
    /// degenerate axis every in-range value is in bin 0.
    pub fn locate(&self, v: f64) -> Option<usize> {
        if self.bins == 0 || !(v >= self.min && v <= self.max) {
            return None;
        }
        let span = self.max - self.min;
        if span <= 0.0 {
            return Some(0);
        }
        let idx = ((v - self.min) / span * self.bins as f64).floor() as usize;
        Some(idx.min(self.bins - 1))
    }

    /// Bin holding `v` as `floor((v - min) / size)`, the last bin taking `max`.
    ///
    /// Same range rules as [`locate`](Self::locate), but rounds through the
    /// bin width, so a value on a boundary can fall one bin lower than the
    /// edge comparison would put it.
    pub fn step_index(&self, v: f64) -> Option<usize> {
        if self.bins == 0 || !(v >= self.min && v <= self.max) {
            return None;
        }
        let size = self.size();
        if size <= 0.0 {
            return Some(0);
        }
        let idx = ((v - self.min) / size).floor() as usize;
        Some(idx.min(self.bins - 1))
    }

    /// Midpoint of bin `i`.
    pub fn center(&self, i: usize) -> f64 {
        self.min + (i as f64 + 0.5) * self.size()
    }

    /// The `bins + 1` bin boundaries.
    pub fn edges(&self) -> Vec<f64> {
        linspace(self.min, self.max, self.bins + 1)
    }
}

/// A projected event with its time of day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedPoint {
    pub x: f64,
    pub y: f64,
    /// Minutes since midnight.
    pub minutes: u32,
}

/// One non-empty spatio-temporal cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterCell {
    pub x_center: f64,
    pub y_center: f64,
    /// Minutes since midnight at the middle of the time bin.
    pub time_center: f64,
    pub crash_count: u64,
}

/// Bin-size parameters of a rasterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterSpec {
    /// Spatial bins along each axis.
    pub bins: usize,
    /// Temporal bin width in minutes.
    pub time_bin_size: u32,
}

impl Default for RasterSpec {
    fn default() -> Self {
        Self {
            bins: 100,
            time_bin_size: 15,
        }
    }
}

impl RasterSpec {
    pub fn validate(&self) -> Result<()> {
        if self.bins == 0 {
            return Err(Error::InvalidParameter("bins must be positive".into()));
        }
        if self.time_bin_size == 0 || self.time_bin_size > MINUTES_PER_DAY {
            return Err(Error::InvalidParameter(format!(
                "time_bin_size must be in 1..={MINUTES_PER_DAY} minutes, got {}",
                self.time_bin_size
            )));
        }
        Ok(())
    }

    /// Midpoint (in minutes) of the time bin containing `minutes`.
    pub fn time_center(&self, minutes: u32) -> f64 {
        let size = f64::from(self.time_bin_size);
        f64::from(minutes / self.time_bin_size) * size + size / 2.0
    }
}

/// Counts `points` per spatial and time-of-day bin.
///
/// Cells are returned ordered by `(x_bin, y_bin, time_bin)` and their counts
/// sum to `points.len()`.
pub fn rasterize(points: &[TimedPoint], spec: RasterSpec) -> Result<Vec<RasterCell>> {
    spec.validate()?;

    let (Some((min_x, max_x)), Some((min_y, max_y))) = (
        min_max(points.iter().map(|p| p.x)),
        min_max(points.iter().map(|p| p.y)),
    ) else {
        return Ok(Vec::new());
    };

    let x_axis = AxisBins::new(min_x, max_x, spec.bins);
    let y_axis = AxisBins::new(min_y, max_y, spec.bins);

    let mut counts: BTreeMap<(usize, usize, u32), u64> = BTreeMap::new();
    for p in points {
        let (Some(xb), Some(yb)) = (x_axis.step_index(p.x), y_axis.step_index(p.y)) else {
            return Err(Error::InvalidParameter(format!(
                "non-finite coordinate ({}, {})",
                p.x, p.y
            )));
        };
        let tb = p.minutes / spec.time_bin_size;
        *counts.entry((xb, yb, tb)).or_default() += 1;
    }

    let size = f64::from(spec.time_bin_size);
    Ok(counts
        .into_iter()
        .map(|((xb, yb, tb), crash_count)| RasterCell {
            x_center: x_axis.center(xb),
            y_center: y_axis.center(yb),
            time_center: f64::from(tb) * size + size / 2.0,
            crash_count,
        })
        .collect())
}
