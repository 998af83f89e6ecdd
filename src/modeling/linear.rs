//! Least-squares crash-count model over raster cells.
//!
//! Inputs `(x_centered, y_centered, time_center)` are standardised and expanded
//! into all monomials up to `degree`, then fitted with an intercept by ordinary
//! least squares. The fitted model is stored as JSON.

use crate::error::{Error, Result};
use crate::raster::RasterCell;
use crate::utility::{mean, stddev};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;

pub const MAX_DEGREE: u32 = 3;

/// Predicts the expected crash count of a raster cell.
pub trait CrashModel {
    fn predict(&self, x_centered: f64, y_centered: f64, time_center: f64) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub degree: u32,
    pub feature_means: [f64; 3],
    pub feature_scales: [f64; 3],
    /// Powers of `(x, y, t)` for each coefficient.
    pub exponents: Vec<[u32; 3]>,
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    /// Coefficient of determination on the training cells.
    pub r_squared: f64,
    pub n_samples: usize,
}

impl LinearModel {
    /// Fits `crash_count ~ poly(x_center, y_center, time_center)` on `cells`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] for a degree outside `1..=3`,
    /// [`Error::EmptyData`] with fewer cells than parameters, and
    /// [`Error::SingularSystem`] when features are collinear.
    #[tracing::instrument(skip(cells), fields(cells = cells.len()))]
    pub fn fit(cells: &[RasterCell], degree: u32) -> Result<Self> {
        if !(1..=MAX_DEGREE).contains(&degree) {
            return Err(Error::InvalidParameter(format!(
                "degree must be in 1..={MAX_DEGREE}, got {degree}"
            )));
        }
        let exponents = monomials(degree);
        let n_params = exponents.len() + 1;
        if cells.len() < n_params {
            return Err(Error::EmptyData(format!(
                "need at least {n_params} raster cells for a degree {degree} model, got {}",
                cells.len()
            )));
        }

        let columns: [Vec<f64>; 3] = [
            cells.iter().map(|c| c.x_center).collect(),
            cells.iter().map(|c| c.y_center).collect(),
            cells.iter().map(|c| c.time_center).collect(),
        ];
        let mut feature_means = [0.0; 3];
        let mut feature_scales = [1.0; 3];
        for (i, col) in columns.iter().enumerate() {
            feature_means[i] = mean(col);
            let sd = stddev(col, feature_means[i]);
            if sd > 0.0 {
                feature_scales[i] = sd;
            }
        }

        let mut model = LinearModel {
            degree,
            feature_means,
            feature_scales,
            exponents,
            intercept: 0.0,
            coefficients: Vec::new(),
            r_squared: 0.0,
            n_samples: cells.len(),
        };

        // Accumulate the normal equations X'X b = X'y
        let mut xtx = vec![vec![0.0; n_params]; n_params];
        let mut xty = vec![0.0; n_params];
        for cell in cells {
            let row = model.design_row(cell.x_center, cell.y_center, cell.time_center);
            let target = cell.crash_count as f64;
            for i in 0..n_params {
                xty[i] += row[i] * target;
                for j in 0..n_params {
                    xtx[i][j] += row[i] * row[j];
                }
            }
        }

        let beta = solve(xtx, xty)?;
        model.intercept = beta[0];
        model.coefficients = beta[1..].to_vec();

        let targets: Vec<f64> = cells.iter().map(|c| c.crash_count as f64).collect();
        let target_mean = mean(&targets);
        let (ss_res, ss_tot) = cells.iter().zip(&targets).fold((0.0, 0.0), |(res, tot), (c, y)| {
            let pred = model.predict(c.x_center, c.y_center, c.time_center);
            (res + (y - pred).powi(2), tot + (y - target_mean).powi(2))
        });
        model.r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

        info!(degree, params = n_params, r_squared = model.r_squared, "Model fitted");
        Ok(model)
    }

    /// `[1, features...]` for one observation.
    fn design_row(&self, x: f64, y: f64, t: f64) -> Vec<f64> {
        let z = [
            (x - self.feature_means[0]) / self.feature_scales[0],
            (y - self.feature_means[1]) / self.feature_scales[1],
            (t - self.feature_means[2]) / self.feature_scales[2],
        ];
        std::iter::once(1.0)
            .chain(self.exponents.iter().map(|e| {
                z[0].powi(e[0] as i32) * z[1].powi(e[1] as i32) * z[2].powi(e[2] as i32)
            }))
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let model: LinearModel = serde_json::from_reader(reader)?;
        if model.coefficients.len() != model.exponents.len() {
            return Err(Error::InvalidParameter(format!(
                "model has {} coefficients for {} features",
                model.coefficients.len(),
                model.exponents.len()
            )));
        }
        Ok(model)
    }
}

impl CrashModel for LinearModel {
    fn predict(&self, x_centered: f64, y_centered: f64, time_center: f64) -> f64 {
        let row = self.design_row(x_centered, y_centered, time_center);
        self.intercept
            + row[1..]
                .iter()
                .zip(&self.coefficients)
                .map(|(f, c)| f * c)
                .sum::<f64>()
    }
}

/// Exponent triples with total degree `1..=degree`, lowest degree first.
fn monomials(degree: u32) -> Vec<[u32; 3]> {
    let mut out = Vec::new();
    for total in 1..=degree {
        for a in (0..=total).rev() {
            for b in (0..=total - a).rev() {
                out.push([a, b, total - a - b]);
            }
        }
    }
    out
}

/// Solves `a x = b` by Gaussian elimination with partial pivoting.
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Result<Vec<f64>> {
    let n = b.len();
    let tolerance = a
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].abs())
        .fold(0.0, f64::max)
        * 1e-12;

    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() <= tolerance {
            return Err(Error::SingularSystem(format!("no pivot in column {col}")));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}
