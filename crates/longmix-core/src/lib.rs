//! Orchestration core: fallback policy, batch runs, pooling and
//! sensitivity analysis.
//!
//! Data flow: imputed datasets → [`Orchestrator`] → bridge per cell →
//! diagnostics and [`fit_cell`] fallback → cell records in the store →
//! [`pool`] → pooled results → [`SensitivityController`] comparisons.

mod error;
pub mod fallback;
pub mod orchestrator;
pub mod pool;
pub mod sensitivity;

pub use error::{CoreError, Result};
pub use fallback::{Decision, decide_error, decide_fit, fit_cell};
pub use orchestrator::{CellEntry, CellOrigin, Orchestrator, RunOptions, RunReport};
pub use pool::{
    CONFIDENCE_LEVEL, PoolOptions, PoolingFailure, barnard_rubin_df, pool, pool_records,
};
pub use sensitivity::{
    SensitivityController, SensitivityRun, StabilityRule, compare_pooled,
};
