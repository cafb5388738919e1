pub mod comparison;
pub mod config;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod fit;
pub mod formula;
pub mod ids;
pub mod pooled;
pub mod record;
pub mod spec;

pub use comparison::{CoefficientComparison, ComparisonReport};
pub use config::{
    Alternate, AlternateEntry, AnalysisConfig, DataSettings, DiagnosticThresholds,
    EngineSettings, OutcomeEntry, PoolingSettings, SensitivitySettings, StoreSettings,
};
pub use dataset::{ImputedDataset, NestingTracker, Observation, Treatment, validate_observations};
pub use diagnostics::{DiagnosticsReport, TestStatistic};
pub use error::{ModelError, Result};
pub use fit::{
    ConvergenceStatus, CovarianceMatrix, FitResult, Provenance, RandomEffectCorrelation,
    RandomEffectVariance,
};
pub use formula::{
    FixedEffects, Grouping, ParsedFormula, RandomTerm, Term, parse_random_effects,
    render_formula,
};
pub use ids::{CellKey, ModelSpecId};
pub use pooled::{PooledCoefficient, PooledResult};
pub use record::{AttemptOutcome, AttemptRecord, CellRecord, CellStatus, FailureReason};
pub use spec::{Family, LadderState, Link, ModelSpec, OutcomeSpec};
