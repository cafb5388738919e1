use std::collections::BTreeMap;

use approx::assert_relative_eq;
use chrono::Utc;
use longmix_core::{PoolOptions, PoolingFailure, pool, pool_records};
use longmix_model::{
    CellKey, CellRecord, ConvergenceStatus, CovarianceMatrix, DiagnosticsReport, FailureReason,
    FitResult, LadderState, ModelSpecId, Provenance,
};
use proptest::prelude::*;

fn spec_id() -> ModelSpecId {
    ModelSpecId::from_digest(&[7; 8])
}

fn fit(imputation: usize, coefficients: &[(&str, f64, f64)]) -> FitResult {
    let names: Vec<String> = coefficients.iter().map(|(n, _, _)| (*n).to_string()).collect();
    let values = coefficients
        .iter()
        .enumerate()
        .map(|(i, (_, _, se))| {
            (0..coefficients.len())
                .map(|j| if i == j { se * se } else { 0.0 })
                .collect()
        })
        .collect();
    FitResult {
        cell_key: CellKey::new("crp", spec_id(), imputation),
        point_estimates: coefficients
            .iter()
            .map(|(n, q, _)| ((*n).to_string(), *q))
            .collect(),
        standard_errors: coefficients
            .iter()
            .map(|(n, _, se)| ((*n).to_string(), *se))
            .collect(),
        covariance: CovarianceMatrix::new(names, values),
        random_effect_variances: Vec::new(),
        random_effect_correlations: Vec::new(),
        residual_variance: Some(1.0),
        log_likelihood: None,
        aic: None,
        bic: None,
        residuals: Vec::new(),
        fitted_values: Vec::new(),
        df_residual: None,
        n_observations: 40,
        convergence_status: ConvergenceStatus::Converged,
        engine_singular: false,
        engine_messages: Vec::new(),
        diagnostics: DiagnosticsReport::default(),
        provenance: Provenance {
            formula: "crp ~ treatment * time + (1 | participant_id)".into(),
            ladder_state: LadderState::RandomInterceptOnly,
            engine_version: "test".into(),
            fitted_at: Utc::now(),
            attempt_number: 1,
            data_digest: String::new(),
            duration_ms: 0,
        },
    }
}

fn treatment_fits(estimates: &[f64], se: f64) -> Vec<FitResult> {
    estimates
        .iter()
        .enumerate()
        .map(|(i, q)| fit(i + 1, &[("(Intercept)", 1.0, 0.3), ("treatmentB", *q, se)]))
        .collect()
}

#[test]
fn three_imputation_worked_example() {
    let fits = treatment_fits(&[2.0, 2.4, 1.6], 0.5);
    let refs: Vec<&FitResult> = fits.iter().collect();
    let pooled = pool(&refs, &PoolOptions::default()).unwrap();
    let c = pooled.coefficient("treatmentB").unwrap();

    assert_relative_eq!(c.estimate, 2.0, epsilon = 1e-12);
    assert_relative_eq!(c.within_variance, 0.25, epsilon = 1e-12);
    assert_relative_eq!(c.between_variance, 0.16, epsilon = 1e-12);
    assert_relative_eq!(c.total_variance, 0.463_333_333, epsilon = 1e-8);
    assert_relative_eq!(c.fraction_missing_information, 0.460_431_654, epsilon = 1e-8);
    assert_relative_eq!(c.relative_increase_variance, 0.853_333_333, epsilon = 1e-8);
    // no complete-data df: Rubin (1987)
    // (M-1)/λ² = 2 / 0.460431654²
    assert_relative_eq!(c.degrees_of_freedom.unwrap(), 9.434_082_031, epsilon = 1e-6);
    assert!(c.ci_lower < 2.0 && c.ci_upper > 2.0);
    assert!(c.p_value > 0.0 && c.p_value < 0.05);
    assert_eq!(pooled.n_successful_imputations, 3);
    assert_eq!(pooled.ladder_states, vec![LadderState::RandomInterceptOnly]);
}

#[test]
fn complete_df_shrinks_degrees_of_freedom() {
    let fits = treatment_fits(&[2.0, 2.4, 1.6], 0.5);
    let refs: Vec<&FitResult> = fits.iter().collect();
    let options = PoolOptions {
        complete_df: Some(20.0),
        ..PoolOptions::default()
    };
    let pooled = pool(&refs, &options).unwrap();
    let c = pooled.coefficient("treatmentB").unwrap();
    // ν_obs = 21/23 · 20 · (1 − λ) = 9.852987175
    // ν = ν_old · ν_obs / (ν_old + ν_obs)
    assert_relative_eq!(c.degrees_of_freedom.unwrap(), 4.819_492_701, epsilon = 1e-6);
    assert_eq!(pooled.complete_df, Some(20.0));

    let rubin = pool(&refs, &PoolOptions::default()).unwrap();
    let wide = rubin.coefficient("treatmentB").unwrap();
    assert!(c.ci_upper - c.ci_lower > wide.ci_upper - wide.ci_lower);
}

#[test]
fn identical_estimates_have_no_between_variance() {
    let fits = treatment_fits(&[1.5, 1.5, 1.5, 1.5], 0.25);
    let refs: Vec<&FitResult> = fits.iter().collect();
    let pooled = pool(&refs, &PoolOptions::default()).unwrap();
    let c = pooled.coefficient("treatmentB").unwrap();
    assert_eq!(c.between_variance, 0.0);
    assert_eq!(c.fraction_missing_information, 0.0);
    assert_relative_eq!(c.total_variance, c.within_variance);
    // infinite df: normal reference
    assert_eq!(c.degrees_of_freedom, None);
    assert_relative_eq!(c.ci_upper - c.estimate, 1.959_964 * 0.25, epsilon = 1e-6);
}

#[test]
fn single_fit_is_insufficient() {
    let fits = treatment_fits(&[2.0], 0.5);
    let refs: Vec<&FitResult> = fits.iter().collect();
    let options = PoolOptions {
        total_imputations: Some(5),
        ..PoolOptions::default()
    };
    assert_eq!(
        pool(&refs, &options).unwrap_err(),
        PoolingFailure::InsufficientFits {
            successful: 1,
            total: 5
        }
    );
    assert!(matches!(
        pool(&[], &PoolOptions::default()),
        Err(PoolingFailure::InsufficientFits { successful: 0, .. })
    ));
}

#[test]
fn differing_coefficient_sets_are_rejected() {
    let a = fit(1, &[("(Intercept)", 1.0, 0.3), ("treatmentB", 2.0, 0.5)]);
    let b = fit(2, &[("(Intercept)", 1.1, 0.3), ("time", 0.4, 0.1)]);
    let err = pool(&[&a, &b], &PoolOptions::default()).unwrap_err();
    assert_eq!(
        err,
        PoolingFailure::CoefficientMismatch {
            reference: 1,
            imputation: 2,
            differing: vec!["time".into(), "treatmentB".into()],
        }
    );
}

#[test]
fn fits_from_different_outcomes_are_rejected() {
    let a = fit(1, &[("(Intercept)", 1.0, 0.3)]);
    let mut b = fit(2, &[("(Intercept)", 1.1, 0.3)]);
    b.cell_key = CellKey::new("il6", spec_id(), 2);
    assert!(matches!(
        pool(&[&a, &b], &PoolOptions::default()),
        Err(PoolingFailure::MixedCells { .. })
    ));
}

#[test]
fn zero_standard_errors_are_degenerate() {
    let fits = treatment_fits(&[2.0, 2.0], 0.0);
    let refs: Vec<&FitResult> = fits.iter().collect();
    assert_eq!(
        pool(&refs, &PoolOptions::default()).unwrap_err(),
        PoolingFailure::DegenerateVariance {
            coefficient: "treatmentB".into()
        }
    );
}

#[test]
fn abandoned_records_count_toward_the_total_only() {
    let fits = treatment_fits(&[2.0, 2.4, 1.6], 0.5);
    let mut records: Vec<CellRecord> = fits
        .into_iter()
        .map(|f| CellRecord::succeeded(f.cell_key.clone(), f, Vec::new()))
        .collect();
    records.push(CellRecord::abandoned(
        CellKey::new("crp", spec_id(), 4),
        FailureReason::LadderExhausted,
        Vec::new(),
    ));
    let pooled = pool_records(&records, &PoolOptions::default()).unwrap();
    assert_eq!(pooled.n_successful_imputations, 3);
    assert_eq!(pooled.n_total_imputations, 4);
    let estimates: BTreeMap<String, f64> = pooled.pooled_estimates();
    assert_relative_eq!(estimates["treatmentB"], 2.0, epsilon = 1e-12);
}

proptest! {
    #[test]
    fn pooled_quantities_stay_in_range(
        draws in prop::collection::vec((0.0f64..1.0, 0.5f64..2.0), 2..10),
        complete_df in prop::option::of(10.0f64..500.0),
    ) {
        let fits: Vec<FitResult> = draws
            .iter()
            .enumerate()
            .map(|(i, (q, se))| fit(i + 1, &[("treatmentB", *q, *se)]))
            .collect();
        let refs: Vec<&FitResult> = fits.iter().collect();
        let options = PoolOptions { complete_df, ..PoolOptions::default() };
        let pooled = pool(&refs, &options).unwrap();
        let c = pooled.coefficient("treatmentB").unwrap();

        prop_assert!(c.total_variance >= c.within_variance);
        prop_assert!(c.between_variance >= 0.0);
        prop_assert!((0.0..=1.0).contains(&c.fraction_missing_information));
        prop_assert!((0.0..=1.0).contains(&c.p_value));
        prop_assert!(c.ci_lower <= c.estimate && c.estimate <= c.ci_upper);
        if let (Some(df), Some(nu_com)) = (c.degrees_of_freedom, complete_df) {
            prop_assert!(df > 0.0);
            prop_assert!(df <= nu_com);
        }
    }
}
