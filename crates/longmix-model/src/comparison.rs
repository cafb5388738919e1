use serde::{Deserialize, Serialize};

use crate::ids::ModelSpecId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientComparison {
    pub name: String,
    pub baseline: f64,
    pub alternate: f64,
    /// `alternate - baseline`.
    pub difference: f64,
    /// Difference relative to |baseline|; `None` when the baseline is zero.
    pub relative_change: Option<f64>,
    pub sign_changed: bool,
    pub unstable: bool,
}

/// Baseline vs. alternate pooled estimates for one outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub outcome: String,
    pub label: String,
    pub baseline_spec_id: Option<ModelSpecId>,
    pub alternate_spec_id: Option<ModelSpecId>,
    pub coefficients: Vec<CoefficientComparison>,
    pub baseline_only: Vec<String>,
    pub alternate_only: Vec<String>,
    /// Set when the alternate run could not be pooled for this outcome.
    pub alternate_failure: Option<String>,
}

impl ComparisonReport {
    pub fn any_unstable(&self) -> bool {
        self.coefficients.iter().any(|c| c.unstable)
    }

    pub fn unstable_coefficients(&self) -> impl Iterator<Item = &CoefficientComparison> {
        self.coefficients.iter().filter(|c| c.unstable)
    }
}
