//! The seam between the bridge and an external fitting engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::marshal::Payload;

/// Limits applied to one engine call.
#[derive(Debug, Clone)]
pub struct CallLimits {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// A fitting engine that hands out exclusive execution contexts.
///
/// The engine value itself is shared across workers; every fit runs in a
/// session obtained from [`FittingEngine::open_session`] and owned by one
/// caller. Sessions are never shared between threads.
pub trait FittingEngine: Send + Sync {
    type Session: EngineSession;

    fn name(&self) -> &str;

    fn open_session(&self) -> Result<Self::Session>;
}

/// An exclusive, scoped execution context.
///
/// Implementations release every external resource in `Drop`, so teardown
/// runs on success, error and unwinding alike. No named state may survive
/// from one `execute` call to the next.
pub trait EngineSession {
    fn execute(&mut self, payload: &Payload, limits: &CallLimits) -> Result<EngineOutput>;
}

/// What the engine reports back, before interpretation by the bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOutput {
    pub engine_version: String,
    /// Set when the engine could not produce a fit at all.
    pub error: Option<EngineFailure>,
    pub converged: bool,
    pub singular: bool,
    pub messages: Vec<String>,
    pub coefficients: Vec<EngineCoefficient>,
    pub vcov_names: Vec<String>,
    /// Missing entries belong to aliased coefficients.
    pub vcov: Vec<Vec<Option<f64>>>,
    pub random_effects: Vec<EngineVarComp>,
    pub correlations: Vec<EngineCorrelation>,
    pub residual_variance: Option<f64>,
    pub log_likelihood: Option<f64>,
    pub aic: Option<f64>,
    pub bic: Option<f64>,
    pub residuals: Vec<f64>,
    pub fitted: Vec<f64>,
    pub df_residual: Option<f64>,
    pub n_obs: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Convergence,
    Conversion,
    Engine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCoefficient {
    pub name: String,
    /// Both missing for non-estimable (aliased) coefficients.
    pub estimate: Option<f64>,
    pub std_error: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineVarComp {
    pub group: String,
    pub term: String,
    pub variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCorrelation {
    pub group: String,
    pub first: String,
    pub second: String,
    pub correlation: f64,
}

impl EngineOutput {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(EngineFailure {
                kind,
                message: message.into(),
            }),
            ..Self::default()
        }
    }
}
