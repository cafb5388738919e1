//! Imputed-dataset ingestion.
//!
//! Discovers the M completed CSV files produced by the imputation step,
//! loads them into Polars DataFrames with identifier columns typed as
//! strings, and checks the participant-in-replicate nesting. Outlier
//! exclusion produces new datasets for sensitivity runs.

mod discovery;
mod error;
mod filter;
mod reader;

// === Error Types ===
pub use error::{IngestError, Result};

// === File Discovery ===
pub use discovery::{discover_imputations, imputation_index, list_csv_files};

// === Loading ===
pub use reader::{LoadOptions, load_imputations, read_imputed_dataset};

// === Filtering ===
pub use filter::{exclude_outliers, outlier_column};
