//! Long-format observations and completed (imputed) datasets.

use std::collections::BTreeMap;

use polars::prelude::{DataFrame, IntoColumn, NamedFrom, Series};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

pub const REPLICATE_COLUMN: &str = "replicate_id";
pub const PARTICIPANT_COLUMN: &str = "participant_id";
pub const TREATMENT_COLUMN: &str = "treatment";
pub const TIME_COLUMN: &str = "time";
pub const BASELINE_COLUMN: &str = "baseline";
pub const OUTLIER_COLUMN: &str = "is_outlier";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Treatment {
    A,
    B,
}

impl Treatment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

/// One measurement of one participant at one time point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub replicate_id: String,
    pub participant_id: String,
    pub treatment: Treatment,
    pub time: u32,
    pub baseline: Option<f64>,
    pub outcome_value: Option<f64>,
    pub is_outlier: bool,
}

/// Tracks participant → (replicate, treatment) to enforce the study design:
/// each participant sits in one replicate and keeps one treatment.
#[derive(Debug, Default)]
pub struct NestingTracker {
    seen: BTreeMap<String, (String, String)>,
}

impl NestingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, participant: &str, replicate: &str, treatment: &str) -> Result<()> {
        match self.seen.get(participant) {
            Some((known_replicate, _)) if known_replicate != replicate => {
                Err(ModelError::ParticipantNotNested {
                    participant: participant.to_string(),
                    first: known_replicate.clone(),
                    second: replicate.to_string(),
                })
            }
            Some((_, known_treatment)) if known_treatment != treatment => {
                Err(ModelError::TreatmentNotConstant {
                    participant: participant.to_string(),
                    first: known_treatment.clone(),
                    second: treatment.to_string(),
                })
            }
            Some(_) => Ok(()),
            None => {
                self.seen.insert(
                    participant.to_string(),
                    (replicate.to_string(), treatment.to_string()),
                );
                Ok(())
            }
        }
    }

    pub fn participant_count(&self) -> usize {
        self.seen.len()
    }
}

/// Checks the nesting and time-invariant treatment invariants.
pub fn validate_observations(observations: &[Observation]) -> Result<()> {
    let mut tracker = NestingTracker::new();
    for obs in observations {
        tracker.observe(
            &obs.participant_id,
            &obs.replicate_id,
            obs.treatment.as_str(),
        )?;
    }
    Ok(())
}

/// One completed copy of the observation table, `index` in `1..=M`.
///
/// The frame is never modified in place; derived datasets (e.g. with
/// outliers removed) are new values.
#[derive(Debug, Clone)]
pub struct ImputedDataset {
    index: usize,
    source: Option<String>,
    frame: DataFrame,
}

impl ImputedDataset {
    pub fn new(index: usize, frame: DataFrame) -> Result<Self> {
        if index == 0 {
            return Err(ModelError::InvalidImputationIndex(index));
        }
        Ok(Self {
            index,
            source: None,
            frame,
        })
    }

    /// Builds a dataset from typed observations, with the outcome stored
    /// under `outcome` and the outlier flag under [`OUTLIER_COLUMN`].
    pub fn from_observations(
        index: usize,
        outcome: &str,
        observations: &[Observation],
    ) -> Result<Self> {
        validate_observations(observations)?;
        let replicate: Vec<String> = observations
            .iter()
            .map(|o| o.replicate_id.clone())
            .collect();
        let participant: Vec<String> = observations
            .iter()
            .map(|o| o.participant_id.clone())
            .collect();
        let treatment: Vec<&str> = observations.iter().map(|o| o.treatment.as_str()).collect();
        let time: Vec<i64> = observations.iter().map(|o| i64::from(o.time)).collect();
        let baseline: Vec<Option<f64>> = observations.iter().map(|o| o.baseline).collect();
        let value: Vec<Option<f64>> = observations.iter().map(|o| o.outcome_value).collect();
        let outlier: Vec<bool> = observations.iter().map(|o| o.is_outlier).collect();

        let frame = DataFrame::new(vec![
            Series::new(REPLICATE_COLUMN.into(), replicate).into_column(),
            Series::new(PARTICIPANT_COLUMN.into(), participant).into_column(),
            Series::new(TREATMENT_COLUMN.into(), treatment).into_column(),
            Series::new(TIME_COLUMN.into(), time).into_column(),
            Series::new(BASELINE_COLUMN.into(), baseline).into_column(),
            Series::new(outcome.into(), value).into_column(),
            Series::new(OUTLIER_COLUMN.into(), outlier).into_column(),
        ])?;
        Self::new(index, frame)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// A new dataset with the same index and source but a different frame.
    pub fn derive(&self, frame: DataFrame) -> Self {
        Self {
            index: self.index,
            source: self.source.clone(),
            frame,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn height(&self) -> usize {
        self.frame.height()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.frame.column(name).is_ok()
    }
}
