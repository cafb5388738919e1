//! Persisted per-cell outcome: terminal status plus the full attempt history.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fit::{ConvergenceStatus, FitResult};
use crate::ids::CellKey;
use crate::spec::LadderState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Converged,
    ConvergedWithWarning,
    Abandoned,
}

impl CellStatus {
    pub fn is_success(self) -> bool {
        !matches!(self, Self::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::ConvergedWithWarning => "converged_with_warning",
            Self::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened on one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Converged,
    ConvergedWithWarning,
    /// Engine returned a fit but flagged it as not converged.
    Failed,
    /// Fit returned but diagnostics flagged a singular random structure.
    Singular,
    ConvergenceError,
    Timeout,
    EngineError,
    DataTypeError,
    ConversionError,
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Converged | Self::ConvergedWithWarning)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::ConvergedWithWarning => "converged_with_warning",
            Self::Failed => "failed",
            Self::Singular => "singular",
            Self::ConvergenceError => "convergence_error",
            Self::Timeout => "timeout",
            Self::EngineError => "engine_error",
            Self::DataTypeError => "data_type_error",
            Self::ConversionError => "conversion_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<ConvergenceStatus> for AttemptOutcome {
    fn from(status: ConvergenceStatus) -> Self {
        match status {
            ConvergenceStatus::Converged => Self::Converged,
            ConvergenceStatus::ConvergedWithWarning => Self::ConvergedWithWarning,
            ConvergenceStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub ladder_state: LadderState,
    pub formula: String,
    pub outcome: AttemptOutcome,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Why a cell ended up abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Every ladder state was tried without an acceptable fit.
    LadderExhausted,
    DataType,
    Conversion,
    /// The engine failed twice in a row at the same state.
    Engine,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LadderExhausted => "ladder_exhausted",
            Self::DataType => "data_type",
            Self::Conversion => "conversion",
            Self::Engine => "engine",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub key: CellKey,
    pub status: CellStatus,
    pub final_state: LadderState,
    pub fit: Option<FitResult>,
    pub attempts: Vec<AttemptRecord>,
    pub failure: Option<FailureReason>,
    pub recorded_at: DateTime<Utc>,
}

impl CellRecord {
    pub fn succeeded(key: CellKey, fit: FitResult, attempts: Vec<AttemptRecord>) -> Self {
        let status = match fit.convergence_status {
            ConvergenceStatus::Converged => CellStatus::Converged,
            _ => CellStatus::ConvergedWithWarning,
        };
        Self {
            key,
            status,
            final_state: fit.ladder_state(),
            fit: Some(fit),
            attempts,
            failure: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn abandoned(key: CellKey, reason: FailureReason, attempts: Vec<AttemptRecord>) -> Self {
        Self {
            key,
            status: CellStatus::Abandoned,
            final_state: LadderState::Abandoned,
            fit: None,
            attempts,
            failure: Some(reason),
            recorded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.fit.is_some()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}
