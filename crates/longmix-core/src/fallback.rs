//! Convergence and fallback policy for one cell.
//!
//! Walks `FullRandomSlope → RandomInterceptOnly → FixedEffectsOnly` until a
//! fit is accepted or the ladder runs out:
//!
//! * convergence errors, timeouts, `Failed` fits and singular fits move one
//!   state down;
//! * an engine error retries the same state once, a second one in a row
//!   abandons the cell;
//! * data-type, conversion and cancellation errors abandon the cell at once.

use std::time::Instant;

use chrono::Utc;
use longmix_bridge::{Bridge, BridgeError, ErrorClass, FitContext, FittingEngine};
use longmix_model::{
    AttemptOutcome, AttemptRecord, CellKey, CellRecord, ConvergenceStatus, DiagnosticThresholds,
    FailureReason, FitResult, ImputedDataset, LadderState, OutcomeSpec,
};

/// What the policy does after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Simplify,
    RetrySameState,
    Abandon(FailureReason),
}

/// Decides the next step after a fit returned.
pub fn decide_fit(fit: &FitResult, state: LadderState) -> (AttemptOutcome, Decision) {
    if fit.convergence_status == ConvergenceStatus::Failed {
        return (AttemptOutcome::Failed, Decision::Simplify);
    }
    // With no random effects left there is nothing to simplify.
    if fit.diagnostics.is_singular_fit && state != LadderState::FixedEffectsOnly {
        return (AttemptOutcome::Singular, Decision::Simplify);
    }
    (fit.convergence_status.into(), Decision::Accept)
}

/// Decides the next step after a bridge error. `retried` is true when the
/// previous attempt was an engine error at the same state.
pub fn decide_error(error: &BridgeError, retried: bool) -> (AttemptOutcome, Decision) {
    let outcome = match error {
        BridgeError::DataType { .. } => AttemptOutcome::DataTypeError,
        BridgeError::Conversion { .. } => AttemptOutcome::ConversionError,
        BridgeError::Convergence { .. } => AttemptOutcome::ConvergenceError,
        BridgeError::Engine { .. } => AttemptOutcome::EngineError,
        BridgeError::Timeout { .. } => AttemptOutcome::Timeout,
        BridgeError::Cancelled => AttemptOutcome::Cancelled,
    };
    let decision = match error.class() {
        ErrorClass::Recoverable => Decision::Simplify,
        ErrorClass::Transient if retried => Decision::Abandon(FailureReason::Engine),
        ErrorClass::Transient => Decision::RetrySameState,
        ErrorClass::Fatal => Decision::Abandon(match error {
            BridgeError::DataType { .. } => FailureReason::DataType,
            BridgeError::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::Conversion,
        }),
    };
    (outcome, decision)
}

/// Fits one cell, starting at `start` and walking down the ladder.
///
/// `history` holds attempts from an earlier record of the same cell; new
/// attempts are numbered after it and appended. Never fails: every path
/// ends in a [`CellRecord`].
pub fn fit_cell<E: FittingEngine>(
    bridge: &Bridge<E>,
    outcome: &OutcomeSpec,
    dataset: &ImputedDataset,
    key: &CellKey,
    start: LadderState,
    thresholds: &DiagnosticThresholds,
    history: Vec<AttemptRecord>,
) -> CellRecord {
    let mut attempts = history;
    let mut state = start;
    let mut retried = false;

    loop {
        let Some(spec) = outcome.spec_for(state) else {
            return CellRecord::abandoned(key.clone(), FailureReason::LadderExhausted, attempts);
        };
        let attempt_number = u32::try_from(attempts.len() + 1).unwrap_or(u32::MAX);
        let context = FitContext {
            cell_key: key.clone(),
            attempt_number,
        };
        let started_at = Utc::now();
        let clock = Instant::now();

        let result = bridge.fit(dataset, &spec, &context);
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (fit, outcome_kind, decision, message) = match result {
            Ok(fit) => {
                let report = longmix_diagnostics::check(&fit, dataset, thresholds);
                let fit = fit.with_diagnostics(report);
                let (kind, decision) = decide_fit(&fit, state);
                let message = attempt_message(&fit);
                (Some(fit), kind, decision, message)
            }
            Err(error) => {
                let (kind, decision) = decide_error(&error, retried);
                (None, kind, decision, Some(error.to_string()))
            }
        };

        tracing::debug!(
            cell = %key,
            attempt = attempt_number,
            state = %state,
            outcome = outcome_kind.as_str(),
            duration_ms,
            "attempt finished"
        );
        attempts.push(AttemptRecord {
            attempt_number,
            ladder_state: state,
            formula: spec.formula(),
            outcome: outcome_kind,
            message,
            started_at,
            duration_ms,
        });

        match decision {
            Decision::Accept => {
                if let Some(fit) = fit {
                    return CellRecord::succeeded(key.clone(), fit, attempts);
                }
                return CellRecord::abandoned(key.clone(), FailureReason::Engine, attempts);
            }
            Decision::RetrySameState => {
                retried = true;
            }
            Decision::Simplify => {
                retried = false;
                match state.next() {
                    Some(next) if !next.is_terminal() => state = next,
                    _ => {
                        return CellRecord::abandoned(
                            key.clone(),
                            FailureReason::LadderExhausted,
                            attempts,
                        );
                    }
                }
            }
            Decision::Abandon(reason) => {
                return CellRecord::abandoned(key.clone(), reason, attempts);
            }
        }
    }
}

fn attempt_message(fit: &FitResult) -> Option<String> {
    let mut parts: Vec<&str> = fit.engine_messages.iter().map(String::as_str).collect();
    if fit.diagnostics.is_singular_fit {
        parts.extend(fit.diagnostics.notes.iter().map(String::as_str));
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn engine_errors_retry_once() {
        let err = BridgeError::engine("R crashed");
        assert_eq!(decide_error(&err, false).1, Decision::RetrySameState);
        assert_eq!(
            decide_error(&err, true).1,
            Decision::Abandon(FailureReason::Engine)
        );
    }

    #[test]
    fn timeouts_simplify_like_convergence_errors() {
        let timeout = BridgeError::Timeout {
            limit: Duration::from_secs(1),
        };
        assert_eq!(
            decide_error(&timeout, false),
            (AttemptOutcome::Timeout, Decision::Simplify)
        );
        let convergence = BridgeError::Convergence {
            message: "max|grad|".into(),
        };
        assert_eq!(decide_error(&convergence, true).1, Decision::Simplify);
    }

    #[test]
    fn fatal_errors_abandon_with_reason() {
        let data = BridgeError::DataType {
            column: "participant_id".into(),
            message: "numeric".into(),
        };
        assert_eq!(
            decide_error(&data, false).1,
            Decision::Abandon(FailureReason::DataType)
        );
        let conversion = BridgeError::Conversion {
            message: "NaN".into(),
        };
        assert_eq!(
            decide_error(&conversion, false).1,
            Decision::Abandon(FailureReason::Conversion)
        );
        assert_eq!(
            decide_error(&BridgeError::Cancelled, false).1,
            Decision::Abandon(FailureReason::Cancelled)
        );
    }
}
