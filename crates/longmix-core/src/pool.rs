//! Rubin's rules with the Barnard–Rubin small-sample degrees of freedom.
//!
//! For M successful fits of one coefficient with estimates `q_m` and
//! standard errors `u_m`:
//!
//! ```text
//! Q̄ = mean(q)        W = mean(u²)        B = var(q)  (divisor M-1)
//! T = W + (1 + 1/M) B
//! λ = (1 + 1/M) B / T              (fraction of missing information)
//! r = (1 + 1/M) B / W              (relative increase in variance)
//! ν_old = (M - 1) / λ²
//! ν_obs = (ν_com + 1) / (ν_com + 3) · ν_com · (1 - λ)
//! ν     = ν_old · ν_obs / (ν_old + ν_obs)
//! ```
//!
//! Without a complete-data ν_com the Rubin (1987) ν_old is used. With B = 0
//! the df is ν_obs, or infinite when ν_com is unknown.

use std::collections::BTreeSet;

use chrono::Utc;
use longmix_model::{CellRecord, FitResult, LadderState, PooledCoefficient, PooledResult};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use thiserror::Error;

/// Two-sided confidence level of the reported intervals.
pub const CONFIDENCE_LEVEL: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolingFailure {
    #[error("pooling needs at least 2 successful fits, got {successful} of {total}")]
    InsufficientFits { successful: usize, total: usize },

    #[error(
        "imputation {imputation} has coefficients that differ from imputation {reference}: {}",
        .differing.join(", ")
    )]
    CoefficientMismatch {
        reference: usize,
        imputation: usize,
        differing: Vec<String>,
    },

    #[error("fits belong to different cells: {expected} and {found}")]
    MixedCells { expected: String, found: String },

    #[error("coefficient {coefficient} has no sampling variance")]
    DegenerateVariance { coefficient: String },
}

#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Complete-data degrees of freedom; defaults to the smallest
    /// `df_residual` among the fits.
    pub complete_df: Option<f64>,
    /// Number of imputations attempted, when larger than the fits given.
    pub total_imputations: Option<usize>,
}

/// The Barnard–Rubin degrees of freedom; `None` means infinite.
pub fn barnard_rubin_df(m: usize, lambda: f64, complete_df: Option<f64>) -> Option<f64> {
    let m = m as f64;
    let nu_obs =
        complete_df.map(|nu_com| (nu_com + 1.0) / (nu_com + 3.0) * nu_com * (1.0 - lambda));
    if lambda <= 0.0 {
        return nu_obs;
    }
    let nu_old = (m - 1.0) / (lambda * lambda);
    match nu_obs {
        Some(nu_obs) => Some(nu_old * nu_obs / (nu_old + nu_obs)),
        None => Some(nu_old),
    }
}

/// Pools the successful fits of one (outcome, model) pair.
pub fn pool(fits: &[&FitResult], options: &PoolOptions) -> Result<PooledResult, PoolingFailure> {
    let total = options.total_imputations.unwrap_or(fits.len()).max(fits.len());
    let [first, ..] = fits else {
        return Err(PoolingFailure::InsufficientFits {
            successful: 0,
            total,
        });
    };
    if fits.len() < 2 {
        return Err(PoolingFailure::InsufficientFits {
            successful: fits.len(),
            total,
        });
    }

    let pool_key = first.cell_key.pool_key();
    for fit in fits {
        if fit.cell_key.pool_key() != pool_key {
            return Err(PoolingFailure::MixedCells {
                expected: format!("{}/{}", pool_key.0, pool_key.1),
                found: format!("{}/{}", fit.cell_key.outcome, fit.cell_key.model_spec_id),
            });
        }
    }

    let names: BTreeSet<&str> = first.coefficient_names().collect();
    for fit in &fits[1..] {
        let other: BTreeSet<&str> = fit.coefficient_names().collect();
        if other != names {
            return Err(PoolingFailure::CoefficientMismatch {
                reference: first.cell_key.imputation_index,
                imputation: fit.cell_key.imputation_index,
                differing: names
                    .symmetric_difference(&other)
                    .map(|s| (*s).to_string())
                    .collect(),
            });
        }
    }

    let complete_df = options.complete_df.or_else(|| {
        fits.iter()
            .map(|f| f.df_residual)
            .collect::<Option<Vec<f64>>>()
            .and_then(|dfs| dfs.into_iter().filter(|d| *d > 0.0).reduce(f64::min))
    });

    let coefficients = names
        .iter()
        .map(|name| pool_coefficient(name, fits, complete_df))
        .collect::<Result<Vec<_>, _>>()?;

    let ladder_states: Vec<LadderState> = fits
        .iter()
        .map(|f| f.ladder_state())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    Ok(PooledResult {
        outcome: pool_key.0,
        model_spec_id: pool_key.1,
        ladder_states,
        coefficients,
        n_successful_imputations: fits.len(),
        n_total_imputations: total,
        complete_df,
        created_at: Utc::now(),
    })
}

/// Pools the successful records among `records`; every record counts
/// toward the total number of imputations.
pub fn pool_records(
    records: &[CellRecord],
    options: &PoolOptions,
) -> Result<PooledResult, PoolingFailure> {
    let fits: Vec<&FitResult> = records
        .iter()
        .filter(|r| r.is_success())
        .filter_map(|r| r.fit.as_ref())
        .collect();
    let options = PoolOptions {
        total_imputations: Some(options.total_imputations.unwrap_or(records.len())),
        ..options.clone()
    };
    pool(&fits, &options)
}

fn pool_coefficient(
    name: &str,
    fits: &[&FitResult],
    complete_df: Option<f64>,
) -> Result<PooledCoefficient, PoolingFailure> {
    let m = fits.len() as f64;
    let mut estimates = Vec::with_capacity(fits.len());
    let mut variances = Vec::with_capacity(fits.len());
    for fit in fits {
        match (fit.estimate(name), fit.standard_error(name)) {
            (Some(q), Some(se)) if q.is_finite() && se.is_finite() => {
                estimates.push(q);
                variances.push(se * se);
            }
            _ => {
                return Err(PoolingFailure::DegenerateVariance {
                    coefficient: name.to_string(),
                });
            }
        }
    }

    let estimate = estimates.iter().sum::<f64>() / m;
    let within = variances.iter().sum::<f64>() / m;
    let between = estimates.iter().map(|q| (q - estimate).powi(2)).sum::<f64>() / (m - 1.0);
    let inflation = (1.0 + 1.0 / m) * between;
    let total = within + inflation;
    if within <= 0.0 {
        return Err(PoolingFailure::DegenerateVariance {
            coefficient: name.to_string(),
        });
    }

    let lambda = inflation / total;
    let riv = inflation / within;
    let df = barnard_rubin_df(fits.len(), lambda, complete_df);
    let standard_error = total.sqrt();
    let t_statistic = estimate / standard_error;
    let (p_value, critical) = reference_tail(t_statistic, df);

    Ok(PooledCoefficient {
        name: name.to_string(),
        estimate,
        within_variance: within,
        between_variance: between,
        total_variance: total,
        degrees_of_freedom: df,
        fraction_missing_information: lambda,
        relative_increase_variance: riv,
        standard_error,
        t_statistic,
        p_value,
        ci_lower: estimate - critical * standard_error,
        ci_upper: estimate + critical * standard_error,
    })
}

/// Two-sided p-value of `t` and the critical value for the interval, from
/// Student t with `df` degrees of freedom, or the standard normal.
fn reference_tail(t: f64, df: Option<f64>) -> (f64, f64) {
    let upper = 1.0 - (1.0 - CONFIDENCE_LEVEL) / 2.0;
    if let Some(df) = df.filter(|d| d.is_finite() && *d > 0.0)
        && let Ok(dist) = StudentsT::new(0.0, 1.0, df)
    {
        return (2.0 * dist.sf(t.abs()), dist.inverse_cdf(upper));
    }
    let normal = Normal::standard();
    (2.0 * normal.sf(t.abs()), normal.inverse_cdf(upper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn df_without_between_variance() {
        assert_eq!(barnard_rubin_df(5, 0.0, None), None);
        let df = barnard_rubin_df(5, 0.0, Some(30.0)).unwrap();
        assert_relative_eq!(df, 31.0 / 33.0 * 30.0);
    }

    #[test]
    fn df_falls_back_to_rubin_1987() {
        assert_relative_eq!(barnard_rubin_df(3, 0.5, None).unwrap(), 8.0);
    }

    #[test]
    fn small_sample_df_never_exceeds_complete_df() {
        for lambda in [0.01, 0.2, 0.5, 0.9] {
            let df = barnard_rubin_df(10, lambda, Some(20.0)).unwrap();
            assert!(df > 0.0 && df < 20.0, "lambda {lambda}: df {df}");
        }
    }

    #[test]
    fn infinite_df_uses_normal_reference() {
        let (p, critical) = reference_tail(1.959_963_984_540_054, None);
        assert_relative_eq!(p, 0.05, epsilon = 1e-9);
        assert_relative_eq!(critical, 1.959_963_984_540_054, epsilon = 1e-9);
    }
}
