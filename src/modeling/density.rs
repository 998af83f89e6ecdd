//! Kernel density and raster-histogram estimates over 2-D point patterns.

use crate::error::{Error, Result};
use crate::raster::AxisBins;
use crate::utility::{linspace, mean, median, min_max, stddev};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Smoothing kernels, each normalised to unit mass in two dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kernel {
    #[default]
    Gaussian,
    Tophat,
    Epanechnikov,
    Exponential,
    Linear,
    Cosine,
}

impl Kernel {
    /// Log of the kernel value at distance `r` for bandwidth `h`, including
    /// the 2-D normalisation constant. `-inf` outside a compact support.
    fn log_value(self, r: f64, h: f64) -> f64 {
        let h2 = h * h;
        let u = r / h;
        match self {
            Kernel::Gaussian => -0.5 * u * u - (2.0 * PI * h2).ln(),
            Kernel::Exponential => -u - (2.0 * PI * h2).ln(),
            _ if u >= 1.0 => f64::NEG_INFINITY,
            Kernel::Tophat => -(PI * h2).ln(),
            Kernel::Epanechnikov => (1.0 - u * u).ln() + (2.0 / (PI * h2)).ln(),
            Kernel::Linear => (1.0 - u).ln() + (3.0 / (PI * h2)).ln(),
            Kernel::Cosine => (0.5 * PI * u).cos().ln() - (h2 * (4.0 - 8.0 / PI)).ln(),
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kernel::Gaussian => "gaussian",
            Kernel::Tophat => "tophat",
            Kernel::Epanechnikov => "epanechnikov",
            Kernel::Exponential => "exponential",
            Kernel::Linear => "linear",
            Kernel::Cosine => "cosine",
        };
        f.write_str(name)
    }
}

impl FromStr for Kernel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gaussian" => Ok(Kernel::Gaussian),
            "tophat" => Ok(Kernel::Tophat),
            "epanechnikov" => Ok(Kernel::Epanechnikov),
            "exponential" => Ok(Kernel::Exponential),
            "linear" => Ok(Kernel::Linear),
            "cosine" => Ok(Kernel::Cosine),
            other => Err(format!("unknown kernel '{other}'")),
        }
    }
}

/// Dense row-major 2-D array.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid2d {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Grid2d {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    fn get_mut(&mut self, row: usize, col: usize) -> &mut f64 {
        &mut self.data[row * self.cols + col]
    }

    pub fn values(&self) -> &[f64] {
        &self.data
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().copied().map(f).collect(),
        }
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Counts (or densities) per bin; `values.get(ix, iy)` is x-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram2d {
    pub values: Grid2d,
    pub xedges: Vec<f64>,
    pub yedges: Vec<f64>,
}

/// Axis-aligned extent `[x_min, x_max] × [y_min, y_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Extent {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

/// Kernel density estimate plus raster histograms over a fixed point set.
#[derive(Debug, Clone)]
pub struct DensityEstimator {
    data: Vec<[f64; 2]>,
    bandwidth: f64,
    kernel: Kernel,
    extent: Extent,
}

impl DensityEstimator {
    /// # Errors
    ///
    /// [`Error::EmptyData`] without points; [`Error::InvalidParameter`] for a
    /// bandwidth that is not a positive finite number or non-finite points.
    pub fn new(data: Vec<[f64; 2]>, bandwidth: f64, kernel: Kernel) -> Result<Self> {
        if !(bandwidth.is_finite() && bandwidth > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "bandwidth must be positive, got {bandwidth}"
            )));
        }
        if data.iter().flatten().any(|v| !v.is_finite()) {
            return Err(Error::InvalidParameter("points must be finite".into()));
        }
        let (Some((x_min, x_max)), Some((y_min, y_max))) = (
            min_max(data.iter().map(|p| p[0])),
            min_max(data.iter().map(|p| p[1])),
        ) else {
            return Err(Error::EmptyData("density estimator needs at least one point".into()));
        };

        Ok(Self {
            data,
            bandwidth,
            kernel,
            extent: Extent {
                x_min,
                x_max,
                y_min,
                y_max,
            },
        })
    }

    pub fn data(&self) -> &[[f64; 2]] {
        &self.data
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Log density at `point`, computed with log-sum-exp over all samples.
    pub fn score_sample(&self, point: [f64; 2]) -> f64 {
        let logs: Vec<f64> = self
            .data
            .iter()
            .map(|p| {
                let r = (p[0] - point[0]).hypot(p[1] - point[1]);
                self.kernel.log_value(r, self.bandwidth)
            })
            .collect();
        log_sum_exp(&logs) - (self.data.len() as f64).ln()
    }

    pub fn score_samples(&self, points: &[[f64; 2]]) -> Vec<f64> {
        points.iter().map(|p| self.score_sample(*p)).collect()
    }

    /// Evaluates the KDE on a `grid_size × grid_size` lattice over the data extent.
    ///
    /// Returns the `xx`, `yy` meshgrids and the sigmoid-normalised density,
    /// all indexed `[y][x]`. Values lie in `[-1, 1]`, with 0 at the median.
    pub fn evaluate_grid(&self, grid_size: usize) -> (Grid2d, Grid2d, Grid2d) {
        let xs = linspace(self.extent.x_min, self.extent.x_max, grid_size);
        let ys = linspace(self.extent.y_min, self.extent.y_max, grid_size);

        let xx = Grid2d::from_fn(grid_size, grid_size, |_, c| xs[c]);
        let yy = Grid2d::from_fn(grid_size, grid_size, |r, _| ys[r]);
        let density = Grid2d::from_fn(grid_size, grid_size, |r, c| {
            self.score_sample([xs[c], ys[r]]).exp()
        });

        (xx, yy, sigmoid_normalize(&density))
    }

    /// Raster density: counts of the samples on `bins × bins` cells over their extent.
    ///
    /// With `density`, counts are divided by `total × cell area` so the surface
    /// integrates to one.
    pub fn histogram2d(&self, bins: usize, density: bool) -> Result<Histogram2d> {
        histogram2d(&self.data, bins, self.extent, density)
    }

    /// Bins `numerator` and `denominator` samples on the denominator's extent
    /// and returns their ratio, zero wherever the denominator cell is empty.
    ///
    /// With crash points over ride-start points this is crashes per ride.
    pub fn normalized_histogram2d(
        numerator: &DensityEstimator,
        denominator: &DensityEstimator,
        bins: usize,
    ) -> Result<Histogram2d> {
        let num = histogram2d(&numerator.data, bins, denominator.extent, false)?;
        let den = histogram2d(&denominator.data, bins, denominator.extent, false)?;

        let values = Grid2d::from_fn(bins, bins, |ix, iy| {
            let d = den.values.get(ix, iy);
            if d < 1.0 { 0.0 } else { num.values.get(ix, iy) / d }
        });

        Ok(Histogram2d {
            values,
            xedges: den.xedges,
            yedges: den.yedges,
        })
    }
}

/// Maps densities through `(sigmoid((d - median) / std) - 0.5) * 2`.
fn sigmoid_normalize(density: &Grid2d) -> Grid2d {
    let mid = median(density.values());
    let scale = stddev(density.values(), mean(density.values()));
    if !(scale.is_finite() && scale > 0.0) {
        return density.map(|_| 0.0);
    }
    density.map(|d| (1.0 / (1.0 + (-(d - mid) / scale).exp()) - 0.5) * 2.0)
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Histogram with `bins + 1` edges per axis; points outside `extent` are ignored
/// and the upper edge is inclusive. A zero-width axis is widened by 0.5 each side.
fn histogram2d(points: &[[f64; 2]], bins: usize, extent: Extent, density: bool) -> Result<Histogram2d> {
    if bins == 0 {
        return Err(Error::InvalidParameter("bins must be positive".into()));
    }

    let widen = |lo: f64, hi: f64| if lo == hi { (lo - 0.5, hi + 0.5) } else { (lo, hi) };
    let (x_lo, x_hi) = widen(extent.x_min, extent.x_max);
    let (y_lo, y_hi) = widen(extent.y_min, extent.y_max);
    let x_axis = AxisBins::new(x_lo, x_hi, bins);
    let y_axis = AxisBins::new(y_lo, y_hi, bins);

    let mut values = Grid2d::zeros(bins, bins);
    for p in points {
        if let (Some(ix), Some(iy)) = (x_axis.locate(p[0]), y_axis.locate(p[1])) {
            *values.get_mut(ix, iy) += 1.0;
        }
    }

    if density {
        let total = values.sum();
        let area = x_axis.size() * y_axis.size();
        values = if total > 0.0 {
            values.map(|v| v / (total * area))
        } else {
            values
        };
    }

    Ok(Histogram2d {
        values,
        xedges: x_axis.edges(),
        yedges: y_axis.edges(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic, roughly normal cloud (sum of uniforms from a fixed LCG).
    fn normal_cloud(n: usize) -> Vec<[f64; 2]> {
        let mut state: u64 = 42;
        let mut uniform = move || {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        let mut normal = move || (0..12).map(|_| uniform()).sum::<f64>() - 6.0;
        (0..n).map(|_| [normal(), normal()]).collect()
    }

    fn estimator() -> DensityEstimator {
        DensityEstimator::new(normal_cloud(500), 0.5, Kernel::Gaussian).unwrap()
    }

    #[test]
    fn test_initialization() {
        let est = estimator();
        assert_eq!(est.data().len(), 500);
        let e = est.extent();
        assert!(e.x_min < e.x_max && e.y_min < e.y_max);
        assert_eq!(est.bandwidth(), 0.5);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            DensityEstimator::new(vec![], 1.0, Kernel::Gaussian),
            Err(Error::EmptyData(_))
        ));
        assert!(matches!(
            DensityEstimator::new(vec![[0.0, 0.0]], 0.0, Kernel::Gaussian),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            DensityEstimator::new(vec![[f64::NAN, 0.0]], 1.0, Kernel::Gaussian),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_kernels_integrate_to_one() {
        let step = 0.01;
        let n = 800;
        for kernel in [
            Kernel::Gaussian,
            Kernel::Tophat,
            Kernel::Epanechnikov,
            Kernel::Exponential,
            Kernel::Linear,
            Kernel::Cosine,
        ] {
            let est = DensityEstimator::new(vec![[0.0, 0.0]], 0.5, kernel).unwrap();
            let mut mass = 0.0;
            for i in 0..n {
                for j in 0..n {
                    let x = -4.0 + (i as f64 + 0.5) * step;
                    let y = -4.0 + (j as f64 + 0.5) * step;
                    mass += est.score_sample([x, y]).exp() * step * step;
                }
            }
            assert!((mass - 1.0).abs() < 1e-2, "{kernel} integrates to {mass}");
        }
    }

    #[test]
    fn test_gaussian_peak_value() {
        let est = DensityEstimator::new(vec![[1.0, 1.0]], 2.0, Kernel::Gaussian).unwrap();
        let peak = est.score_sample([1.0, 1.0]).exp();
        assert!((peak - 1.0 / (2.0 * PI * 4.0)).abs() < 1e-12);
    }

    #[test]
    fn test_far_points_do_not_underflow_to_nan() {
        let est = DensityEstimator::new(vec![[0.0, 0.0]], 1.0, Kernel::Gaussian).unwrap();
        let score = est.score_sample([1e4, 1e4]);
        assert!(score.is_finite());
        assert!(score < -1e7);

        let est = DensityEstimator::new(vec![[0.0, 0.0]], 1.0, Kernel::Tophat).unwrap();
        assert_eq!(est.score_sample([5.0, 0.0]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_evaluate_grid() {
        let (xx, yy, density) = estimator().evaluate_grid(40);
        assert_eq!(xx.shape(), (40, 40));
        assert_eq!(yy.shape(), xx.shape());
        assert_eq!(density.shape(), xx.shape());
        assert!(density.values().iter().all(|d| (-1.0..=1.0).contains(d)));

        // x varies along columns, y along rows
        assert!(xx.get(0, 0) < xx.get(0, 39));
        assert_eq!(xx.get(0, 5), xx.get(17, 5));
        assert!(yy.get(0, 0) < yy.get(39, 0));
    }

    #[test]
    fn test_evaluate_grid_flat_density_is_zero() {
        let est = DensityEstimator::new(vec![[0.0, 0.0]], 1.0, Kernel::Gaussian).unwrap();
        let (_, _, density) = est.evaluate_grid(3);
        assert!(density.values().iter().all(|d| *d == 0.0));
    }

    #[test]
    fn test_histogram2d() {
        let hist = estimator().histogram2d(50, false).unwrap();
        assert_eq!(hist.values.shape(), (50, 50));
        assert_eq!(hist.xedges.len(), 51);
        assert_eq!(hist.yedges.len(), 51);
        assert!(hist.values.values().iter().all(|v| *v >= 0.0));
        // Extremes sit on the inclusive upper edge, so nothing is lost
        assert_eq!(hist.values.sum(), 500.0);
    }

    #[test]
    fn test_histogram2d_density_integrates_to_one() {
        let hist = estimator().histogram2d(20, true).unwrap();
        let dx = hist.xedges[1] - hist.xedges[0];
        let dy = hist.yedges[1] - hist.yedges[0];
        assert!((hist.values.sum() * dx * dy - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_histogram2d_is_x_major() {
        let est = DensityEstimator::new(
            vec![[0.0, 0.0], [10.0, 0.0], [10.0, 1.0]],
            1.0,
            Kernel::Gaussian,
        )
        .unwrap();
        let hist = est.histogram2d(2, false).unwrap();
        assert_eq!(hist.values.get(0, 0), 1.0);
        assert_eq!(hist.values.get(1, 0), 1.0);
        assert_eq!(hist.values.get(1, 1), 1.0);
        assert_eq!(hist.values.get(0, 1), 0.0);
    }

    #[test]
    fn test_degenerate_extent_is_widened() {
        let est = DensityEstimator::new(vec![[2.0, 3.0]], 1.0, Kernel::Gaussian).unwrap();
        let hist = est.histogram2d(1, false).unwrap();
        assert_eq!(hist.xedges, vec![1.5, 2.5]);
        assert_eq!(hist.values.get(0, 0), 1.0);
    }

    #[test]
    fn test_normalized_histogram2d() {
        let rides = DensityEstimator::new(
            vec![[0.0, 0.0], [0.0, 0.0], [0.0, 0.0], [0.0, 0.0], [10.0, 10.0]],
            1.0,
            Kernel::Gaussian,
        )
        .unwrap();
        let crashes = DensityEstimator::new(
            vec![[0.5, 0.5], [9.0, 1.0], [20.0, 20.0]],
            1.0,
            Kernel::Gaussian,
        )
        .unwrap();

        let ratio = DensityEstimator::normalized_histogram2d(&crashes, &rides, 2).unwrap();
        assert_eq!(ratio.values.get(0, 0), 0.25);
        // no rides in this cell, so the crash there is ignored
        assert_eq!(ratio.values.get(1, 0), 0.0);
        assert_eq!(ratio.values.get(1, 1), 0.0);
        assert_eq!(ratio.xedges, vec![0.0, 5.0, 10.0]);
    }

    #[test]
    fn test_kernel_parsing() {
        assert_eq!("Gaussian".parse::<Kernel>().unwrap(), Kernel::Gaussian);
        assert_eq!("tophat".parse::<Kernel>().unwrap(), Kernel::Tophat);
        assert!("box".parse::<Kernel>().is_err());
        assert_eq!(Kernel::Epanechnikov.to_string(), "epanechnikov");
    }
}
