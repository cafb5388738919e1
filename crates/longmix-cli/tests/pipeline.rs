//! Integration tests for the shared command steps.

use std::collections::BTreeMap;

use chrono::Utc;
use longmix_cli::pipeline::{Analysis, Overrides, pool_store, store_status};
use longmix_model::{
    AnalysisConfig, CellKey, CellRecord, ConvergenceStatus, CovarianceMatrix, DiagnosticsReport,
    FailureReason, FitResult, LadderState, OutcomeSpec, Provenance,
};
use longmix_store::ResultStore;
use tempfile::tempdir;

const CONFIG: &str = r#"
[engine]
workers = 3

[[outcomes]]
name = "crp"
formula = "crp ~ treatment * time + (1 + time | participant_id)"

[[outcomes]]
name = "il6"
family = "gamma"
link = "log"
formula = "il6 ~ treatment * time + (1 | participant_id)"

[[sensitivity.alternates]]
label = "no_outliers"
exclude_outliers = true
"#;

fn analysis() -> Analysis {
    Analysis::from_config(AnalysisConfig::from_toml_str(CONFIG).unwrap()).unwrap()
}

fn outcome<'a>(analysis: &'a Analysis, name: &str) -> &'a OutcomeSpec {
    analysis
        .outcomes
        .iter()
        .find(|o| o.outcome() == name)
        .unwrap()
}

fn record(spec: &OutcomeSpec, imputation: usize, estimate: f64, state: LadderState) -> CellRecord {
    let key = CellKey::new(spec.outcome(), spec.id(), imputation);
    let fit = FitResult {
        cell_key: key.clone(),
        point_estimates: BTreeMap::from([
            ("(Intercept)".to_string(), 3.0),
            ("treatmentB".to_string(), estimate),
        ]),
        standard_errors: BTreeMap::from([
            ("(Intercept)".to_string(), 0.4),
            ("treatmentB".to_string(), 0.5),
        ]),
        covariance: CovarianceMatrix::new(
            vec!["(Intercept)".into(), "treatmentB".into()],
            vec![vec![0.16, 0.0], vec![0.0, 0.25]],
        ),
        random_effect_variances: Vec::new(),
        random_effect_correlations: Vec::new(),
        residual_variance: Some(1.0),
        log_likelihood: None,
        aic: None,
        bic: None,
        residuals: Vec::new(),
        fitted_values: Vec::new(),
        df_residual: Some(40.0),
        n_observations: 42,
        convergence_status: ConvergenceStatus::Converged,
        engine_singular: false,
        engine_messages: Vec::new(),
        diagnostics: DiagnosticsReport::default(),
        provenance: Provenance {
            formula: spec.primary().formula(),
            ladder_state: state,
            engine_version: "test".into(),
            fitted_at: Utc::now(),
            attempt_number: 1,
            data_digest: String::new(),
            duration_ms: 0,
        },
    };
    CellRecord::succeeded(key, fit, Vec::new())
}

#[test]
fn config_outcomes_are_parsed_once() {
    let analysis = analysis();
    assert_eq!(analysis.outcome_names(), vec!["crp", "il6"]);
    let options = analysis.run_options();
    assert_eq!(options.workers, 3);
    assert!(options.harmonize);
    assert_eq!(analysis.stability_rule().threshold, 0.5);
    assert_eq!(analysis.pool_options().complete_df, None);
}

#[test]
fn overrides_take_precedence() {
    let dir = tempdir().unwrap();
    let overrides = Overrides {
        store_root: Some(dir.path().join("results")),
        workers: Some(1),
        no_harmonize: true,
        outcomes: vec!["il6".into()],
        ..Overrides::default()
    };
    let analysis = analysis().apply(&overrides).unwrap();
    assert_eq!(analysis.outcome_names(), vec!["il6"]);
    assert_eq!(analysis.run_options().workers, 1);
    assert!(!analysis.run_options().harmonize);
    let store = analysis.open_store().unwrap();
    assert_eq!(store.root(), dir.path().join("results"));
}

#[test]
fn unknown_outcome_filter_is_an_error() {
    let overrides = Overrides {
        outcomes: vec!["tnf".into()],
        ..Overrides::default()
    };
    let err = analysis().apply(&overrides).unwrap_err();
    assert!(err.to_string().contains("tnf"));
}

#[test]
fn invalid_config_reports_context() {
    let config = AnalysisConfig::from_toml_str(
        "[[outcomes]]\nname = \"crp\"\nformula = \"il6 ~ time + (1 | participant_id)\"\n",
    )
    .unwrap();
    let err = Analysis::from_config(config).unwrap_err();
    assert!(format!("{err:#}").contains("validate configuration"));
}

#[test]
fn pooling_and_status_from_the_store() {
    let dir = tempdir().unwrap();
    let store = ResultStore::open(dir.path()).unwrap();
    let analysis = analysis();
    let crp = outcome(&analysis, "crp");
    let il6 = outcome(&analysis, "il6");

    for (m, estimate) in [(1, 2.0), (2, 2.4), (3, 1.6)] {
        store
            .save_cell(&record(crp, m, estimate, LadderState::FullRandomSlope))
            .unwrap();
    }
    store
        .save_cell(&record(il6, 1, 0.3, LadderState::RandomInterceptOnly))
        .unwrap();
    store
        .save_cell(&CellRecord::abandoned(
            CellKey::new("il6", il6.id(), 2),
            FailureReason::LadderExhausted,
            Vec::new(),
        ))
        .unwrap();

    let pooled = pool_store(&store, &analysis.outcomes, &analysis.pool_options()).unwrap();
    assert_eq!(pooled.len(), 2);
    let crp_pooled = pooled[0].result.as_ref().unwrap();
    assert_eq!(crp_pooled.n_successful_imputations, 3);
    assert_eq!(crp_pooled.complete_df, Some(40.0));
    assert!(pooled[1].result.is_err());
    let csv = std::fs::read_to_string(store.pooled_csv_path()).unwrap();
    assert_eq!(csv.lines().count(), 3);

    let status = store_status(&store).unwrap();
    assert_eq!(status.len(), 2);
    let crp_row = status.iter().find(|r| r.outcome == "crp").unwrap();
    assert_eq!(crp_row.converged, 3);
    assert!(crp_row.pooled);
    let il6_row = status.iter().find(|r| r.outcome == "il6").unwrap();
    assert_eq!((il6_row.converged, il6_row.abandoned), (1, 1));
    assert_eq!(il6_row.total(), 2);
    assert!(!il6_row.pooled);
    assert_eq!(
        il6_row.ladder_states.iter().copied().collect::<Vec<_>>(),
        vec![LadderState::RandomInterceptOnly]
    );
}
