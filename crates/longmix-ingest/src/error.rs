//! Error types for imputed-dataset ingestion.

use std::path::PathBuf;

use longmix_model::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    // === File System Errors ===
    #[error("directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },

    #[error("failed to read directory {path}: {source}")]
    DirectoryRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // === CSV Parsing Errors ===
    #[error("failed to parse CSV {path}: {message}")]
    CsvParse { path: PathBuf, message: String },

    #[error("CSV file has no rows: {path}")]
    EmptyDataFrame { path: PathBuf },

    // === Imputation Set Errors ===
    #[error("no imputed datasets found in {path}")]
    NoImputations { path: PathBuf },

    #[error("imputation {index} appears twice: {first} and {second}")]
    DuplicateImputation {
        index: usize,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("imputation indices must run 1..=M without gaps; missing {missing}")]
    ImputationGap { missing: usize },

    // === Schema Errors ===
    #[error("required column '{column}' not found in {path}")]
    MissingColumn { column: String, path: PathBuf },

    #[error("column '{column}' has {count} missing values in imputation {index}")]
    MissingValues {
        column: String,
        index: usize,
        count: usize,
    },

    #[error("invalid dataset: {0}")]
    Model(#[from] ModelError),

    #[error("DataFrame operation failed: {message}")]
    DataFrame { message: String },
}

impl From<polars::prelude::PolarsError> for IngestError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        Self::DataFrame {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
