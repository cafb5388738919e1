use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use longmix_bridge::{EngineReport, RscriptEngine};
use longmix_cli::pipeline::{Analysis, Overrides, PoolOutcome, StatusRow, pool_store, store_status};
use longmix_core::{Orchestrator, RunReport, SensitivityController, SensitivityRun};
use longmix_model::{AnalysisConfig, ImputedDataset};
use tracing::{info, info_span};

use crate::cli::{DoctorArgs, InputArgs, PoolArgs, RunArgs, SensitivityArgs, StoreArgs};

pub struct RunSummary {
    pub store_root: PathBuf,
    pub report: RunReport,
    pub pooled: Option<Vec<PoolOutcome>>,
}

impl RunSummary {
    pub fn has_pooling_failures(&self) -> bool {
        self.pooled
            .as_ref()
            .is_some_and(|p| p.iter().any(|o| o.result.is_err()))
    }
}

pub struct StatusSummary {
    pub store_root: PathBuf,
    pub rows: Vec<StatusRow>,
    pub namespaces: Vec<String>,
}

fn overrides(store: &StoreArgs, input: Option<&InputArgs>) -> Overrides {
    let mut overrides = Overrides {
        store_root: store.store.clone(),
        ..Overrides::default()
    };
    if let Some(input) = input {
        overrides.data_dir.clone_from(&input.data_dir);
        overrides.workers = input.workers;
        overrides.no_harmonize = input.no_harmonize;
        overrides.outcomes.clone_from(&input.outcomes);
    }
    overrides
}

fn progress_bar(total: usize, hidden: bool) -> Result<ProgressBar> {
    if hidden || !io::stderr().is_terminal() {
        return Ok(ProgressBar::hidden());
    }
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} cells {msg}",
        )
        .context("progress bar template")?,
    );
    Ok(bar)
}

fn fit_all(
    analysis: &Analysis,
    store: &longmix_store::ResultStore,
    imputations: &[ImputedDataset],
    no_progress: bool,
) -> Result<RunReport> {
    let bridge = analysis.bridge();
    let total = Orchestrator::<RscriptEngine>::cell_count(&analysis.outcomes, imputations);
    let bar = progress_bar(total, no_progress)?;
    let ticker = bar.clone();
    let report = Orchestrator::new(&bridge, store, analysis.run_options())
        .with_progress(move |record| {
            ticker.set_message(format!("{} {}", record.key, record.status));
            ticker.inc(1);
        })
        .run(&analysis.outcomes, imputations)
        .context("run cells")?;
    bar.finish_and_clear();
    Ok(report)
}

pub fn run_analysis(config: &Path, args: &RunArgs) -> Result<RunSummary> {
    let analysis = Analysis::load(config)?.apply(&overrides(&args.store, Some(&args.input)))?;
    let span = info_span!("analysis", config = %config.display());
    let _guard = span.enter();

    let store = analysis.open_store()?;
    let imputations = analysis.load_imputations()?;
    let report = fit_all(&analysis, &store, &imputations, args.input.no_progress)?;

    let pooled = if args.no_pool {
        None
    } else {
        let options = analysis.pool_options();
        Some(pool_store(&store, &analysis.outcomes, &options)?)
    };
    Ok(RunSummary {
        store_root: store.root().to_path_buf(),
        report,
        pooled,
    })
}

pub fn run_pool(config: &Path, args: &PoolArgs) -> Result<Vec<PoolOutcome>> {
    let mut overrides = overrides(&args.store, None);
    overrides.outcomes.clone_from(&args.outcomes);
    let analysis = Analysis::load(config)?.apply(&overrides)?;
    let store = analysis.open_store()?;
    let mut options = analysis.pool_options();
    if args.complete_df.is_some() {
        options.complete_df = args.complete_df;
    }
    pool_store(&store, &analysis.outcomes, &options)
}

pub fn run_sensitivity(config: &Path, args: &SensitivityArgs) -> Result<Vec<SensitivityRun>> {
    let analysis = Analysis::load(config)?.apply(&overrides(&args.store, Some(&args.input)))?;
    let mut alternates = analysis.config.alternates().context("sensitivity alternates")?;
    if !args.labels.is_empty() {
        for label in &args.labels {
            anyhow::ensure!(
                alternates.iter().any(|a| &a.label == label),
                "sensitivity alternate {label} is not configured"
            );
        }
        alternates.retain(|a| args.labels.contains(&a.label));
    }
    anyhow::ensure!(
        !alternates.is_empty(),
        "no [[sensitivity.alternates]] configured"
    );

    let store = analysis.open_store()?;
    let imputations = analysis.load_imputations()?;
    let bridge = analysis.bridge();
    let controller = SensitivityController::new(
        &bridge,
        &store,
        analysis.run_options(),
        analysis.pool_options(),
    )
    .with_rule(analysis.stability_rule())
    .with_outlier_pattern(analysis.config.data.outlier_column.clone());

    let mut runs = Vec::with_capacity(alternates.len());
    for alternate in &alternates {
        let run = controller
            .run(alternate, &analysis.outcomes, &imputations)
            .with_context(|| format!("sensitivity alternate {}", alternate.label))?;
        info!(
            label = %alternate.label,
            unstable = run.unstable_outcomes().count(),
            "alternate finished"
        );
        runs.push(run);
    }
    Ok(runs)
}

pub fn run_status(config: &Path, args: &StoreArgs) -> Result<StatusSummary> {
    let analysis = Analysis::load(config)?.apply(&overrides(args, None))?;
    let store = analysis.open_store()?;
    Ok(StatusSummary {
        store_root: store.root().to_path_buf(),
        rows: store_status(&store)?,
        namespaces: store.namespaces().context("list sensitivity namespaces")?,
    })
}

/// Probes R. A missing configuration file falls back to the defaults.
pub fn run_doctor(config: &Path, args: &DoctorArgs) -> Result<EngineReport> {
    let rscript = match &args.rscript {
        Some(path) => path.clone(),
        None if config.exists() => AnalysisConfig::load(config)
            .with_context(|| format!("load configuration {}", config.display()))?
            .engine
            .rscript,
        None => AnalysisConfig::default().engine.rscript,
    };
    Ok(RscriptEngine::new(rscript).doctor())
}
