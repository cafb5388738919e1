//! Flat CSV export of pooled estimates, one row per coefficient.

use longmix_model::{LadderState, PooledResult};
use serde::Serialize;

use crate::error::{Result, StoreError};

#[derive(Debug, Serialize)]
struct PooledRow<'a> {
    outcome: &'a str,
    model_spec_id: &'a str,
    ladder_states: String,
    coefficient: &'a str,
    estimate: f64,
    std_error: f64,
    /// Empty when the degrees of freedom are infinite.
    df: Option<f64>,
    t_statistic: f64,
    p_value: f64,
    ci_lower: f64,
    ci_upper: f64,
    within_variance: f64,
    between_variance: f64,
    total_variance: f64,
    fmi: f64,
    riv: f64,
    n_successful: usize,
    n_total: usize,
}

pub(crate) fn pooled_csv(results: &[PooledResult]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for result in results {
        let ladder_states = result
            .ladder_states
            .iter()
            .copied()
            .map(LadderState::as_str)
            .collect::<Vec<_>>()
            .join(";");
        for c in &result.coefficients {
            writer
                .serialize(PooledRow {
                    outcome: &result.outcome,
                    model_spec_id: result.model_spec_id.as_str(),
                    ladder_states: ladder_states.clone(),
                    coefficient: &c.name,
                    estimate: c.estimate,
                    std_error: c.standard_error,
                    df: c.degrees_of_freedom,
                    t_statistic: c.t_statistic,
                    p_value: c.p_value,
                    ci_lower: c.ci_lower,
                    ci_upper: c.ci_upper,
                    within_variance: c.within_variance,
                    between_variance: c.between_variance,
                    total_variance: c.total_variance,
                    fmi: c.fraction_missing_information,
                    riv: c.relative_increase_variance,
                    n_successful: result.n_successful_imputations,
                    n_total: result.n_total_imputations,
                })
                .map_err(|e| StoreError::serialization("pooled estimates", e))?;
        }
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::serialization("pooled estimates", e.into_error()))
}
