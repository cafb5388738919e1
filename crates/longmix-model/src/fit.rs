//! Per-cell fit results as produced by the bridge.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticsReport;
use crate::ids::CellKey;
use crate::spec::LadderState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged,
    ConvergedWithWarning,
    Failed,
}

impl ConvergenceStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Converged | Self::ConvergedWithWarning)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::ConvergedWithWarning => "converged_with_warning",
            Self::Failed => "failed",
        }
    }
}

/// Fixed-effect covariance matrix with named rows and columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    pub names: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl CovarianceMatrix {
    pub fn new(names: Vec<String>, values: Vec<Vec<f64>>) -> Self {
        Self { names, values }
    }

    pub fn dimension(&self) -> usize {
        self.names.len()
    }

    /// True when the matrix is square and matches its name list.
    pub fn is_well_formed(&self) -> bool {
        self.values.len() == self.names.len()
            && self.values.iter().all(|row| row.len() == self.names.len())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, row: &str, col: &str) -> Option<f64> {
        let i = self.index_of(row)?;
        let j = self.index_of(col)?;
        self.values.get(i)?.get(j).copied()
    }
}

/// Variance component of one random term within one grouping factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEffectVariance {
    pub group: String,
    pub term: String,
    pub variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomEffectCorrelation {
    pub group: String,
    pub first: String,
    pub second: String,
    pub correlation: f64,
}

/// Where a fit came from and how it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub formula: String,
    pub ladder_state: LadderState,
    pub engine_version: String,
    pub fitted_at: DateTime<Utc>,
    pub attempt_number: u32,
    /// SHA-256 of the marshaled payload sent to the engine.
    pub data_digest: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub cell_key: CellKey,
    pub point_estimates: BTreeMap<String, f64>,
    pub standard_errors: BTreeMap<String, f64>,
    pub covariance: CovarianceMatrix,
    pub random_effect_variances: Vec<RandomEffectVariance>,
    #[serde(default)]
    pub random_effect_correlations: Vec<RandomEffectCorrelation>,
    pub residual_variance: Option<f64>,
    pub log_likelihood: Option<f64>,
    pub aic: Option<f64>,
    pub bic: Option<f64>,
    pub residuals: Vec<f64>,
    pub fitted_values: Vec<f64>,
    /// Complete-data residual degrees of freedom, when the engine reports one.
    pub df_residual: Option<f64>,
    pub n_observations: usize,
    pub convergence_status: ConvergenceStatus,
    /// Singular fit as reported by the engine itself.
    pub engine_singular: bool,
    #[serde(default)]
    pub engine_messages: Vec<String>,
    pub diagnostics: DiagnosticsReport,
    pub provenance: Provenance,
}

impl FitResult {
    pub fn coefficient_names(&self) -> impl Iterator<Item = &str> {
        self.point_estimates.keys().map(String::as_str)
    }

    pub fn estimate(&self, name: &str) -> Option<f64> {
        self.point_estimates.get(name).copied()
    }

    pub fn standard_error(&self, name: &str) -> Option<f64> {
        self.standard_errors.get(name).copied()
    }

    pub fn ladder_state(&self) -> LadderState {
        self.provenance.ladder_state
    }

    /// Attaches a diagnostics report, returning the updated fit.
    ///
    /// A singular fit can never be reported as plainly `Converged`.
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsReport) -> Self {
        if diagnostics.is_singular_fit && self.convergence_status == ConvergenceStatus::Converged
        {
            self.convergence_status = ConvergenceStatus::ConvergedWithWarning;
        }
        self.diagnostics = diagnostics;
        self
    }
}
