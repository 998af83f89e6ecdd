//! Error types shared by the dataset and modeling layers.

use thiserror::Error;

/// Result type for dataset and modeling operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Source path does not exist
    #[error("The provided path '{0}' does not exist")]
    NotFound(String),

    /// File extension is not one we can read
    #[error("Unsupported file format for '{0}'; expected .csv, .csv.gz or .zip")]
    UnsupportedFormat(String),

    /// Directory (or archive) contained nothing readable
    #[error("No CSV files found in '{0}'")]
    NoCsvFiles(String),

    /// Input table lacks columns the dataset needs
    #[error("Does the input contain the {dataset} dataset? Missing columns: {missing:?}")]
    MissingColumns {
        dataset: &'static str,
        missing: Vec<String>,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An estimator or aggregation received no points
    #[error("No data: {0}")]
    EmptyData(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Rasterization was requested before citibike alignment
    #[error("Crash dataset has not been aligned to a citibike dataset")]
    NotAligned,

    #[error("Unknown station '{0}'")]
    UnknownStation(String),

    /// Least-squares normal equations could not be solved
    #[error("Singular system while fitting model: {0}")]
    SingularSystem(String),
}
