//! `fit(dataset, spec) → FitResult`: validate, marshal, execute, interpret.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use longmix_model::{
    CellKey, ConvergenceStatus, CovarianceMatrix, DiagnosticsReport, FitResult, ImputedDataset,
    ModelSpec, Provenance, RandomEffectCorrelation, RandomEffectVariance,
};

use crate::cancel::CancellationToken;
use crate::engine::{CallLimits, EngineOutput, EngineSession, FailureKind, FittingEngine};
use crate::error::{BridgeError, Result};
use crate::marshal::marshal;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Identifies the cell and attempt a fit belongs to.
#[derive(Debug, Clone)]
pub struct FitContext {
    pub cell_key: CellKey,
    pub attempt_number: u32,
}

pub struct Bridge<E> {
    engine: E,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<E: FittingEngine> Bridge<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            timeout: DEFAULT_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fits `spec` on `dataset` inside a freshly opened engine session.
    ///
    /// Input validation and marshaling happen before a session is opened,
    /// so a [`BridgeError::DataType`] never reaches the engine. The session
    /// is dropped (and torn down) before this returns, on every path.
    pub fn fit(
        &self,
        dataset: &ImputedDataset,
        spec: &ModelSpec,
        context: &FitContext,
    ) -> Result<FitResult> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        let payload = marshal(dataset, spec)?;
        let limits = CallLimits {
            timeout: self.timeout,
            cancel: self.cancel.clone(),
        };

        let started = Instant::now();
        let output = {
            let mut session = self.engine.open_session()?;
            session.execute(&payload, &limits)?
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let provenance = Provenance {
            formula: payload.request.formula.clone(),
            ladder_state: spec.ladder_state(),
            engine_version: if output.engine_version.is_empty() {
                self.engine.name().to_string()
            } else {
                output.engine_version.clone()
            },
            fitted_at: Utc::now(),
            attempt_number: context.attempt_number,
            data_digest: payload.digest,
            duration_ms,
        };
        interpret(output, context.cell_key.clone(), provenance)
    }
}

/// Restricts the engine covariance to estimable coefficients whose row is
/// complete. Estimable names dropped for a missing entry are returned.
fn estimable_covariance(
    names: &[String],
    vcov: &[Vec<Option<f64>>],
    estimable: &BTreeMap<String, f64>,
) -> (CovarianceMatrix, Vec<String>) {
    let candidates: Vec<usize> = (0..names.len())
        .filter(|&i| estimable.contains_key(&names[i]))
        .collect();
    let (keep, incomplete): (Vec<usize>, Vec<usize>) =
        candidates.iter().copied().partition(|&i| {
            candidates
                .iter()
                .all(|&j| vcov[i][j].is_some_and(f64::is_finite))
        });
    let values = keep
        .iter()
        .map(|&i| {
            keep.iter()
                .map(|&j| vcov[i][j].unwrap_or(f64::NAN))
                .collect()
        })
        .collect();
    let kept_names = keep.iter().map(|&i| names[i].clone()).collect();
    let dropped = incomplete.iter().map(|&i| names[i].clone()).collect();
    (CovarianceMatrix::new(kept_names, values), dropped)
}

/// Turns raw engine output into a [`FitResult`] or a typed failure.
///
/// The status reflects the engine's own diagnostics: a singular fit or any
/// optimizer message yields `ConvergedWithWarning`, a reported
/// non-convergence or a non-estimable coefficient yields `Failed`.
pub fn interpret(
    output: EngineOutput,
    cell_key: CellKey,
    provenance: Provenance,
) -> Result<FitResult> {
    if let Some(failure) = output.error {
        return Err(match failure.kind {
            FailureKind::Convergence => BridgeError::Convergence {
                message: failure.message,
            },
            FailureKind::Conversion => BridgeError::Conversion {
                message: failure.message,
            },
            FailureKind::Engine => BridgeError::Engine {
                message: failure.message,
            },
        });
    }
    if output.coefficients.is_empty() {
        return Err(BridgeError::engine("engine returned no coefficients"));
    }

    let mut messages = output.messages;
    let mut point_estimates = BTreeMap::new();
    let mut standard_errors = BTreeMap::new();
    let mut non_estimable = false;
    for coefficient in output.coefficients {
        match (coefficient.estimate, coefficient.std_error) {
            (Some(estimate), Some(se)) if estimate.is_finite() && se.is_finite() => {
                point_estimates.insert(coefficient.name.clone(), estimate);
                standard_errors.insert(coefficient.name, se);
            }
            _ => {
                non_estimable = true;
                messages.push(format!("coefficient {} is not estimable", coefficient.name));
            }
        }
    }

    let n = output.vcov_names.len();
    if output.vcov.len() != n || output.vcov.iter().any(|row| row.len() != n) {
        return Err(BridgeError::engine(format!("covariance matrix is not {n}x{n}")));
    }
    let (covariance, incomplete) =
        estimable_covariance(&output.vcov_names, &output.vcov, &point_estimates);
    for name in incomplete {
        non_estimable = true;
        messages.push(format!("covariance of {name} is not estimable"));
    }

    let convergence_status = if !output.converged || non_estimable {
        ConvergenceStatus::Failed
    } else if output.singular || !messages.is_empty() {
        ConvergenceStatus::ConvergedWithWarning
    } else {
        ConvergenceStatus::Converged
    };

    let n_observations = output.n_obs.unwrap_or(output.residuals.len());
    Ok(FitResult {
        cell_key,
        point_estimates,
        standard_errors,
        covariance,
        random_effect_variances: output
            .random_effects
            .into_iter()
            .map(|v| RandomEffectVariance {
                group: v.group,
                term: v.term,
                variance: v.variance,
            })
            .collect(),
        random_effect_correlations: output
            .correlations
            .into_iter()
            .map(|c| RandomEffectCorrelation {
                group: c.group,
                first: c.first,
                second: c.second,
                correlation: c.correlation,
            })
            .collect(),
        residual_variance: output.residual_variance,
        log_likelihood: output.log_likelihood,
        aic: output.aic,
        bic: output.bic,
        residuals: output.residuals,
        fitted_values: output.fitted,
        df_residual: output.df_residual,
        n_observations,
        convergence_status,
        engine_singular: output.singular,
        engine_messages: messages,
        diagnostics: DiagnosticsReport {
            is_singular_fit: output.singular,
            ..DiagnosticsReport::default()
        },
        provenance,
    })
}
