//! Deterministic marshaling of one dataset + spec into an engine request.
//!
//! Only columns the formula references cross the boundary. Factor columns
//! travel as strings, numeric columns as finite `f64`. Map keys are sorted,
//! so the serialized payload (and its digest) depends only on content.

use std::collections::BTreeMap;

use longmix_model::{Family, ImputedDataset, LadderState, Link, ModelSpec};
use polars::prelude::{Column, DataType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRequest {
    pub formula: String,
    pub response: String,
    pub family: Family,
    pub link: Link,
    pub ladder_state: LadderState,
    /// Whether the formula carries random-effect blocks.
    pub random: bool,
    pub n_rows: usize,
    pub factors: BTreeMap<String, Vec<String>>,
    pub numeric: BTreeMap<String, Vec<f64>>,
}

/// A request together with its serialized bytes and their SHA-256 digest.
#[derive(Debug, Clone)]
pub struct Payload {
    pub request: FitRequest,
    pub bytes: Vec<u8>,
    pub digest: String,
}

/// Validates and converts the columns `spec` needs.
///
/// Fails with [`BridgeError::DataType`] for a missing, non-numeric or
/// incomplete response and for identifier columns that are not
/// string-typed, before any engine is involved.
pub fn marshal(dataset: &ImputedDataset, spec: &ModelSpec) -> Result<Payload> {
    let frame = dataset.frame();
    let response = spec.outcome();
    let grouping = spec.grouping_columns();

    let mut factors = BTreeMap::new();
    let mut numeric = BTreeMap::new();

    let outcome = response_values(frame.column(response).ok(), response)?;
    numeric.insert(response.to_string(), outcome);

    for name in &grouping {
        let column = frame
            .column(name)
            .map_err(|_| BridgeError::data_type(name, "grouping column not found"))?;
        factors.insert(name.clone(), identifier_values(column, name)?);
    }

    for name in spec.predictor_columns() {
        if factors.contains_key(&name) || numeric.contains_key(&name) {
            continue;
        }
        let column = frame
            .column(&name)
            .map_err(|_| BridgeError::data_type(&name, "predictor column not found"))?;
        match column.dtype() {
            DataType::String => {
                factors.insert(name.clone(), string_values(column, &name)?);
            }
            DataType::Boolean => {
                let values = column
                    .bool()?
                    .into_iter()
                    .map(|v| {
                        v.map(|b| if b { "TRUE" } else { "FALSE" }.to_string())
                            .ok_or_else(|| missing_value(&name))
                    })
                    .collect::<Result<Vec<_>>>()?;
                factors.insert(name.clone(), values);
            }
            dtype if dtype.is_integer() || dtype.is_float() => {
                numeric.insert(name.clone(), numeric_values(column, &name)?);
            }
            other => {
                return Err(BridgeError::conversion(format!(
                    "column '{name}' has unsupported type {other}"
                )));
            }
        }
    }

    let request = FitRequest {
        formula: spec.formula(),
        response: response.to_string(),
        family: spec.family(),
        link: spec.link(),
        ladder_state: spec.ladder_state(),
        random: !spec.random().is_empty(),
        n_rows: frame.height(),
        factors,
        numeric,
    };
    let bytes = serde_json::to_vec(&request)
        .map_err(|e| BridgeError::conversion(format!("failed to serialize request: {e}")))?;
    let digest = hex::encode(Sha256::digest(&bytes));
    Ok(Payload {
        request,
        bytes,
        digest,
    })
}

fn missing_value(column: &str) -> BridgeError {
    BridgeError::conversion(format!("column '{column}' contains missing values"))
}

fn response_values(column: Option<&Column>, name: &str) -> Result<Vec<f64>> {
    let Some(column) = column else {
        return Err(BridgeError::data_type(name, "outcome column not found"));
    };
    let dtype = column.dtype();
    if !(dtype.is_integer() || dtype.is_float()) {
        return Err(BridgeError::data_type(
            name,
            format!("outcome must be numeric, found {dtype}"),
        ));
    }
    let missing = column.null_count();
    if missing > 0 {
        return Err(BridgeError::data_type(
            name,
            format!("{missing} missing outcome values"),
        ));
    }
    numeric_values(column, name)
}

fn identifier_values(column: &Column, name: &str) -> Result<Vec<String>> {
    let dtype = column.dtype();
    if dtype.is_integer() || dtype.is_float() {
        return Err(BridgeError::data_type(
            name,
            format!("identifier is numeric-encoded ({dtype}); expected a string column"),
        ));
    }
    if dtype != &DataType::String {
        return Err(BridgeError::data_type(
            name,
            format!("identifier has type {dtype}; expected a string column"),
        ));
    }
    string_values(column, name)
}

fn string_values(column: &Column, name: &str) -> Result<Vec<String>> {
    column
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string).ok_or_else(|| missing_value(name)))
        .collect()
}

fn numeric_values(column: &Column, name: &str) -> Result<Vec<f64>> {
    let cast = column.cast(&DataType::Float64)?;
    cast.f64()?
        .into_iter()
        .map(|v| match v {
            Some(x) if x.is_finite() => Ok(x),
            Some(x) => Err(BridgeError::conversion(format!(
                "column '{name}' contains non-finite value {x}"
            ))),
            None => Err(missing_value(name)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::{DataFrame, IntoColumn, NamedFrom, Series};

    fn spec() -> ModelSpec {
        ModelSpec::parse(
            "crp ~ treatment * time + (1 | replicate_id/participant_id)",
            Family::Gaussian,
            None,
        )
        .unwrap()
    }

    fn frame(participant: Column) -> DataFrame {
        DataFrame::new(vec![
            Series::new("replicate_id".into(), ["R1", "R1", "R2"]).into_column(),
            participant,
            Series::new("treatment".into(), ["A", "A", "B"]).into_column(),
            Series::new("time".into(), [0i64, 1, 0]).into_column(),
            Series::new("crp".into(), [1.5, 2.0, 2.5]).into_column(),
            Series::new("unused".into(), [9.0, 9.0, 9.0]).into_column(),
        ])
        .unwrap()
    }

    #[test]
    fn marshals_referenced_columns_only() {
        let participant = Series::new("participant_id".into(), ["P1", "P1", "P2"]).into_column();
        let dataset = ImputedDataset::new(1, frame(participant)).unwrap();
        let payload = marshal(&dataset, &spec()).unwrap();
        let request = &payload.request;
        assert_eq!(request.n_rows, 3);
        assert!(request.random);
        assert_eq!(
            request.factors.keys().collect::<Vec<_>>(),
            vec!["participant_id", "replicate_id", "treatment"]
        );
        assert_eq!(request.numeric.keys().collect::<Vec<_>>(), vec!["crp", "time"]);
        assert_eq!(payload.digest.len(), 64);

        let again = marshal(&dataset, &spec()).unwrap();
        assert_eq!(payload.digest, again.digest);
    }

    #[test]
    fn numeric_identifier_is_data_type_error() {
        let participant = Series::new("participant_id".into(), [1i64, 1, 2]).into_column();
        let dataset = ImputedDataset::new(1, frame(participant)).unwrap();
        match marshal(&dataset, &spec()) {
            Err(BridgeError::DataType { column, .. }) => assert_eq!(column, "participant_id"),
            other => panic!("expected DataType error, got {other:?}"),
        }
    }

    #[test]
    fn non_string_identifier_names_the_expected_type() {
        let participant =
            Series::new("participant_id".into(), [true, true, false]).into_column();
        let dataset = ImputedDataset::new(1, frame(participant)).unwrap();
        match marshal(&dataset, &spec()) {
            Err(BridgeError::DataType { column, message }) => {
                assert_eq!(column, "participant_id");
                assert!(message.contains("expected a string column"), "{message}");
            }
            other => panic!("expected DataType error, got {other:?}"),
        }
    }

    #[test]
    fn missing_outcome_is_data_type_error() {
        let participant = Series::new("participant_id".into(), ["P1", "P1", "P2"]).into_column();
        let mut df = frame(participant);
        df.with_column(Series::new("crp".into(), [Some(1.0), None, Some(2.0)]))
            .unwrap();
        let dataset = ImputedDataset::new(1, df).unwrap();
        assert!(matches!(
            marshal(&dataset, &spec()),
            Err(BridgeError::DataType { .. })
        ));
    }

    #[test]
    fn non_finite_predictor_is_conversion_error() {
        let participant = Series::new("participant_id".into(), ["P1", "P1", "P2"]).into_column();
        let mut df = frame(participant);
        df.with_column(Series::new("time".into(), [0.0, f64::NAN, 1.0]))
            .unwrap();
        let dataset = ImputedDataset::new(1, df).unwrap();
        assert!(matches!(
            marshal(&dataset, &spec()),
            Err(BridgeError::Conversion { .. })
        ));
    }
}
