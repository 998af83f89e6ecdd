pub mod config;
pub mod datasets;
pub mod error;
pub mod fetch;
pub mod geo;
pub mod modeling;
pub mod output;
pub mod raster;
pub mod source;
pub mod utility;

pub use error::{Error, Result};
