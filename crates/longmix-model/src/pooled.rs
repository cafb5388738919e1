//! Pooled (Rubin's rules) results per (outcome, model).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ModelSpecId;
use crate::spec::LadderState;

/// Rubin's-rules summary for one coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledCoefficient {
    pub name: String,
    pub estimate: f64,
    pub within_variance: f64,
    pub between_variance: f64,
    pub total_variance: f64,
    /// Barnard–Rubin degrees of freedom; `None` means infinite.
    pub degrees_of_freedom: Option<f64>,
    pub fraction_missing_information: f64,
    pub relative_increase_variance: f64,
    pub standard_error: f64,
    pub t_statistic: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledResult {
    pub outcome: String,
    pub model_spec_id: ModelSpecId,
    pub ladder_states: Vec<LadderState>,
    pub coefficients: Vec<PooledCoefficient>,
    pub n_successful_imputations: usize,
    pub n_total_imputations: usize,
    /// Complete-data degrees of freedom used for the small-sample adjustment.
    pub complete_df: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl PooledResult {
    pub fn coefficient(&self, name: &str) -> Option<&PooledCoefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }

    pub fn pooled_estimates(&self) -> BTreeMap<String, f64> {
        self.coefficients
            .iter()
            .map(|c| (c.name.clone(), c.estimate))
            .collect()
    }
}
