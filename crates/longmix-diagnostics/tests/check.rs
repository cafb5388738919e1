use std::collections::BTreeMap;

use chrono::Utc;
use longmix_diagnostics::check;
use longmix_model::{
    CellKey, ConvergenceStatus, CovarianceMatrix, DiagnosticThresholds, DiagnosticsReport,
    FitResult, ImputedDataset, LadderState, ModelSpecId, Observation, Provenance,
    RandomEffectCorrelation, RandomEffectVariance, Treatment,
};

/// Twelve participants in two arms, four visits each.
fn dataset() -> ImputedDataset {
    let mut rows = Vec::new();
    for p in 0..12u32 {
        let treatment = if p % 2 == 0 { Treatment::A } else { Treatment::B };
        for time in 0..4 {
            rows.push(Observation {
                replicate_id: format!("R{}", p / 6),
                participant_id: format!("P{p}"),
                treatment,
                time,
                baseline: Some(1.0),
                outcome_value: Some(f64::from(p + time)),
                is_outlier: false,
            });
        }
    }
    ImputedDataset::from_observations(1, "crp", &rows).unwrap()
}

/// Residuals with the same spread in both arms. Rows come in blocks of four
/// per participant and the arms alternate, so both arms see the same values.
fn residuals(n: usize) -> Vec<f64> {
    const PATTERN: [f64; 8] = [-1.2, -0.6, -0.3, 0.0, 0.1, 0.4, 0.7, 0.9];
    (0..n).map(|i| PATTERN[i % 4 + 4 * ((i / 8) % 2)]).collect()
}

fn fit(residuals: Vec<f64>) -> FitResult {
    FitResult {
        cell_key: CellKey::new("crp", ModelSpecId::from_digest(&[3; 8]), 1),
        point_estimates: BTreeMap::new(),
        standard_errors: BTreeMap::new(),
        covariance: CovarianceMatrix::new(
            vec!["(Intercept)".into(), "treatmentB".into(), "time".into()],
            vec![
                vec![0.20, 0.01, 0.00],
                vec![0.01, 0.10, 0.01],
                vec![0.00, 0.01, 0.05],
            ],
        ),
        random_effect_variances: vec![RandomEffectVariance {
            group: "participant_id".into(),
            term: "(Intercept)".into(),
            variance: 0.8,
        }],
        random_effect_correlations: Vec::new(),
        residual_variance: Some(0.4),
        log_likelihood: Some(-50.0),
        aic: None,
        bic: None,
        fitted_values: vec![0.0; residuals.len()],
        n_observations: residuals.len(),
        residuals,
        df_residual: Some(40.0),
        convergence_status: ConvergenceStatus::Converged,
        engine_singular: false,
        engine_messages: Vec::new(),
        diagnostics: DiagnosticsReport::default(),
        provenance: Provenance {
            formula: "crp ~ treatment + time + (1 | participant_id)".into(),
            ladder_state: LadderState::RandomInterceptOnly,
            engine_version: "test".into(),
            fitted_at: Utc::now(),
            attempt_number: 1,
            data_digest: String::new(),
            duration_ms: 0,
        },
    }
}

#[test]
fn well_behaved_fit_passes_everything() {
    let report = check(&fit(residuals(48)), &dataset(), &DiagnosticThresholds::default());
    assert!(report.all_ok(), "{report:?}");
    assert!(report.jarque_bera.is_some());
    assert!(report.brown_forsythe.is_some());
    assert!(report.max_vif.unwrap() < 1.1);
    assert!(report.notes.is_empty());
}

#[test]
fn tiny_variance_component_is_singular() {
    let mut fit = fit(residuals(48));
    fit.random_effect_variances[0].variance = 1e-9;
    let report = check(&fit, &dataset(), &DiagnosticThresholds::default());
    assert!(report.is_singular_fit);
    assert!(report.min_variance_ratio.unwrap() < 1e-4);
    let fit = fit.with_diagnostics(report);
    assert_eq!(fit.convergence_status, ConvergenceStatus::ConvergedWithWarning);
}

#[test]
fn perfect_random_effect_correlation_is_singular() {
    let mut fit = fit(residuals(48));
    fit.random_effect_correlations.push(RandomEffectCorrelation {
        group: "participant_id".into(),
        first: "(Intercept)".into(),
        second: "time".into(),
        correlation: -1.0,
    });
    let report = check(&fit, &dataset(), &DiagnosticThresholds::default());
    assert!(report.is_singular_fit);
}

#[test]
fn engine_flag_alone_marks_singular() {
    let mut fit = fit(residuals(48));
    fit.engine_singular = true;
    assert!(check(&fit, &dataset(), &DiagnosticThresholds::default()).is_singular_fit);
}

#[test]
fn too_few_residuals_pass_with_a_note() {
    let report = check(&fit(residuals(4)), &dataset(), &DiagnosticThresholds::default());
    assert!(report.normality_ok);
    assert!(report.homogeneity_ok);
    assert!(report.jarque_bera.is_none());
    assert_eq!(report.notes.len(), 1);
}

#[test]
fn misaligned_residuals_skip_homogeneity_only() {
    let report = check(&fit(residuals(40)), &dataset(), &DiagnosticThresholds::default());
    assert!(report.jarque_bera.is_some());
    assert!(report.brown_forsythe.is_none());
    assert!(report.homogeneity_ok);
    assert!(report.notes.iter().any(|n| n.contains("homogeneity")));
}

#[test]
fn collinear_fixed_effects_are_flagged_but_not_singular() {
    let mut fit = fit(residuals(48));
    fit.covariance = CovarianceMatrix::new(
        vec!["treatmentB".into(), "time".into()],
        vec![vec![1.0, 0.99], vec![0.99, 1.0]],
    );
    let report = check(&fit, &dataset(), &DiagnosticThresholds::default());
    assert!(!report.multicollinearity_ok);
    assert!(!report.is_singular_fit);
    assert!(report.max_vif.unwrap() > 10.0);
}
