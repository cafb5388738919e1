//! Reading imputed CSV files into [`ImputedDataset`] values.

use std::path::Path;

use longmix_model::dataset::{
    PARTICIPANT_COLUMN, REPLICATE_COLUMN, TIME_COLUMN, TREATMENT_COLUMN,
};
use longmix_model::{ImputedDataset, NestingTracker};
use polars::prelude::*;

use crate::discovery::discover_imputations;
use crate::error::{IngestError, Result};

/// What a loaded dataset must contain.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Identifier columns read as strings regardless of their CSV encoding.
    pub id_columns: Vec<String>,
    /// Outcome columns that must be present and complete.
    pub outcomes: Vec<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            id_columns: vec![
                REPLICATE_COLUMN.to_string(),
                PARTICIPANT_COLUMN.to_string(),
                TREATMENT_COLUMN.to_string(),
            ],
            outcomes: Vec::new(),
        }
    }
}

impl LoadOptions {
    pub fn with_outcomes(mut self, outcomes: impl IntoIterator<Item = String>) -> Self {
        self.outcomes = outcomes.into_iter().collect();
        self
    }
}

fn read_frame(path: &Path) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(100))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .map_err(|e| IngestError::CsvParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
        .finish()
        .map_err(|e| IngestError::CsvParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Reads one imputed dataset and checks it against the study design.
///
/// Identifier columns are cast to strings here, at the ingestion boundary;
/// the bridge rejects numeric identifiers that bypass this step.
pub fn read_imputed_dataset(
    path: &Path,
    index: usize,
    options: &LoadOptions,
) -> Result<ImputedDataset> {
    let mut df = read_frame(path)?;
    if df.height() == 0 {
        return Err(IngestError::EmptyDataFrame {
            path: path.to_path_buf(),
        });
    }

    let required = [
        REPLICATE_COLUMN,
        PARTICIPANT_COLUMN,
        TREATMENT_COLUMN,
        TIME_COLUMN,
    ];
    for column in required
        .iter()
        .copied()
        .chain(options.outcomes.iter().map(String::as_str))
    {
        if df.column(column).is_err() {
            return Err(IngestError::MissingColumn {
                column: column.to_string(),
                path: path.to_path_buf(),
            });
        }
    }

    for name in &options.id_columns {
        let Ok(column) = df.column(name) else {
            continue;
        };
        if column.dtype() != &DataType::String {
            let cast = column.cast(&DataType::String)?;
            df.with_column(cast)?;
        }
    }

    for outcome in &options.outcomes {
        let missing = df.column(outcome)?.null_count();
        if missing > 0 {
            return Err(IngestError::MissingValues {
                column: outcome.clone(),
                index,
                count: missing,
            });
        }
    }

    check_nesting(&df)?;

    let dataset = ImputedDataset::new(index, df)?.with_source(path.display().to_string());
    tracing::debug!(
        path = %path.display(),
        index,
        rows = dataset.height(),
        "loaded imputed dataset"
    );
    Ok(dataset)
}

fn check_nesting(df: &DataFrame) -> Result<()> {
    let participants = df.column(PARTICIPANT_COLUMN)?.str()?;
    let replicates = df.column(REPLICATE_COLUMN)?.str()?;
    let treatments = df.column(TREATMENT_COLUMN)?.str()?;
    let mut tracker = NestingTracker::new();
    for ((participant, replicate), treatment) in participants
        .into_iter()
        .zip(replicates)
        .zip(treatments)
    {
        let (Some(participant), Some(replicate), Some(treatment)) =
            (participant, replicate, treatment)
        else {
            continue;
        };
        tracker.observe(participant, replicate, treatment)?;
    }
    Ok(())
}

/// Discovers and loads all imputed datasets in `dir`, ordered by index.
pub fn load_imputations(dir: &Path, options: &LoadOptions) -> Result<Vec<ImputedDataset>> {
    let files = discover_imputations(dir)?;
    let mut datasets = Vec::with_capacity(files.len());
    for (index, path) in files {
        datasets.push(read_imputed_dataset(&path, index, options)?);
    }
    tracing::info!(
        dir = %dir.display(),
        imputations = datasets.len(),
        "loaded imputed datasets"
    );
    Ok(datasets)
}
