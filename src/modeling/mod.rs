//! Density surfaces, the crash-count model and ride pricing.
//!
//! [`density::DensityEstimator`] turns point patterns into KDE grids and
//! histogram ratios, [`linear::LinearModel`] fits crash counts over raster
//! cells, and [`price::PriceCalculator`] turns its predictions into a price.

pub mod density;
pub mod linear;
pub mod price;
