//! Pipeline parameters, read from an optional JSON file.
//!
//! Every section and field falls back to its default, so a file only needs
//! the values it changes:
//!
//! ```json
//! {
//!   "raster": { "bins": 50 },
//!   "density": { "kernel": "epanechnikov", "bandwidth": 250.0 },
//!   "pricing": { "cost_per_accident": 7500.0 }
//! }
//! ```

use crate::error::{Error, Result};
use crate::modeling::density::Kernel;
use crate::modeling::linear::MAX_DEGREE;
use crate::modeling::price::PricingParams;
use crate::raster::RasterSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub raster: RasterSpec,
    pub density: DensityConfig,
    pub model: ModelConfig,
    pub pricing: PricingParams,
}

impl PipelineConfig {
    /// Reads `path`, or returns the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.raster.validate()?;
        self.density.validate()?;
        self.model.validate()?;
        self.pricing.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    pub bandwidth: f64,
    pub kernel: Kernel,
    /// Lattice size of the KDE surface along each axis.
    pub grid_size: usize,
    /// Histogram bins along each axis.
    pub bins: usize,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            bandwidth: 1.0,
            kernel: Kernel::Gaussian,
            grid_size: 1000,
            bins: 1000,
        }
    }
}

impl DensityConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.bandwidth.is_finite() && self.bandwidth > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "density.bandwidth must be positive, got {}",
                self.bandwidth
            )));
        }
        if self.grid_size == 0 || self.bins == 0 {
            return Err(Error::InvalidParameter(
                "density.grid_size and density.bins must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Polynomial degree of the crash-count model.
    pub degree: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { degree: 1 }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_DEGREE).contains(&self.degree) {
            return Err(Error::InvalidParameter(format!(
                "model.degree must be in 1..={MAX_DEGREE}, got {}",
                self.degree
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::load(None).unwrap();
        assert_eq!(config.raster.bins, 100);
        assert_eq!(config.raster.time_bin_size, 15);
        assert_eq!(config.density.kernel, Kernel::Gaussian);
        assert_eq!(config.density.grid_size, 1000);
        assert_eq!(config.model.degree, 1);
        assert_eq!(config.pricing.time_bin_size, 30);
        assert_eq!(config.pricing.cost_per_accident, 5000.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"raster": {{"bins": 50}}, "density": {{"kernel": "epanechnikov"}}}}"#
        )
        .unwrap();

        let config = PipelineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.raster.bins, 50);
        assert_eq!(config.raster.time_bin_size, 15);
        assert_eq!(config.density.kernel, Kernel::Epanechnikov);
        assert_eq!(config.density.bandwidth, 1.0);
        assert_eq!(config.pricing, PricingParams::default());
    }

    #[test]
    fn test_missing_file() {
        let result = PipelineConfig::load(Some(Path::new("/nonexistent/pipeline.json")));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"density": {{"kernel": "triangle"}}}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::load(Some(file.path())),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.density.bandwidth = 0.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.raster.bins = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.model.degree = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.pricing.traffic_adjustment = -0.5;
        assert!(config.validate().is_err());
    }
}
