use longmix_model::ImputedDataset;
use longmix_model::dataset::OUTLIER_COLUMN;
use polars::prelude::*;

use crate::error::{IngestError, Result};

/// Resolves the outlier flag column for `outcome`: the per-outcome column
/// from `pattern` if present, otherwise the shared [`OUTLIER_COLUMN`].
pub fn outlier_column(dataset: &ImputedDataset, outcome: &str, pattern: &str) -> Option<String> {
    let specific = pattern.replace("{outcome}", outcome);
    if dataset.has_column(&specific) {
        Some(specific)
    } else if dataset.has_column(OUTLIER_COLUMN) {
        Some(OUTLIER_COLUMN.to_string())
    } else {
        None
    }
}

/// Returns a new dataset without the rows flagged as outliers for `outcome`.
///
/// Missing flags count as "not an outlier". The input is left untouched.
pub fn exclude_outliers(
    dataset: &ImputedDataset,
    outcome: &str,
    pattern: &str,
) -> Result<ImputedDataset> {
    let Some(column) = outlier_column(dataset, outcome, pattern) else {
        return Err(IngestError::MissingColumn {
            column: pattern.replace("{outcome}", outcome),
            path: dataset.source().unwrap_or("<memory>").into(),
        });
    };

    let flags = dataset.frame().column(&column)?.cast(&DataType::Boolean)?;
    let keep: BooleanChunked = flags
        .bool()?
        .into_iter()
        .map(|v| Some(!v.unwrap_or(false)))
        .collect();
    let frame = dataset.frame().filter(&keep)?;

    tracing::debug!(
        outcome,
        index = dataset.index(),
        column = %column,
        removed = dataset.height() - frame.height(),
        "excluded flagged outliers"
    );
    Ok(dataset.derive(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use longmix_model::{Observation, Treatment};

    fn dataset() -> ImputedDataset {
        let rows: Vec<Observation> = (0..4)
            .map(|t| Observation {
                replicate_id: "R1".into(),
                participant_id: "P1".into(),
                treatment: Treatment::A,
                time: t,
                baseline: None,
                outcome_value: Some(f64::from(t)),
                is_outlier: t == 2,
            })
            .collect();
        ImputedDataset::from_observations(1, "crp", &rows).unwrap()
    }

    #[test]
    fn test_excludes_flagged_rows_without_mutating() {
        let original = dataset();
        let filtered = exclude_outliers(&original, "crp", "{outcome}_outlier").unwrap();
        assert_eq!(original.height(), 4);
        assert_eq!(filtered.height(), 3);
        assert_eq!(filtered.index(), 1);
    }

    #[test]
    fn test_falls_back_to_shared_flag() {
        let original = dataset();
        assert_eq!(
            outlier_column(&original, "crp", "{outcome}_outlier").as_deref(),
            Some(OUTLIER_COLUMN)
        );
    }
}
