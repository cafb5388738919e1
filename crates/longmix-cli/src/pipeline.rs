//! Steps shared by the subcommands: configuration, inputs, pooling and
//! store summaries.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use longmix_bridge::{Bridge, RscriptEngine};
use longmix_core::{PoolOptions, PoolingFailure, RunOptions, StabilityRule, pool_records};
use longmix_ingest::{LoadOptions, load_imputations};
use longmix_model::{
    AnalysisConfig, CellStatus, ImputedDataset, LadderState, ModelSpecId, OutcomeSpec,
    PooledResult,
};
use longmix_store::ResultStore;
use tracing::{info, info_span, warn};

/// A validated analysis configuration with its parsed outcome specs.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub config: AnalysisConfig,
    pub outcomes: Vec<OutcomeSpec>,
}

/// Command-line overrides applied on top of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_dir: Option<PathBuf>,
    pub store_root: Option<PathBuf>,
    pub workers: Option<usize>,
    pub no_harmonize: bool,
    pub outcomes: Vec<String>,
}

impl Analysis {
    pub fn load(path: &Path) -> Result<Self> {
        let config = AnalysisConfig::load(path)
            .with_context(|| format!("load configuration {}", path.display()))?;
        Self::from_config(config)
    }

    pub fn from_config(config: AnalysisConfig) -> Result<Self> {
        let specs = config.validate().context("validate configuration")?;
        Ok(Self {
            config,
            outcomes: specs.into_values().collect(),
        })
    }

    /// Applies overrides; an outcome filter must name configured outcomes.
    pub fn apply(mut self, overrides: &Overrides) -> Result<Self> {
        if let Some(dir) = &overrides.data_dir {
            self.config.data.directory.clone_from(dir);
        }
        if let Some(root) = &overrides.store_root {
            self.config.store.root.clone_from(root);
        }
        if let Some(workers) = overrides.workers {
            self.config.engine.workers = workers;
        }
        if overrides.no_harmonize {
            self.config.pooling.harmonize_ladder = false;
        }
        if !overrides.outcomes.is_empty() {
            for name in &overrides.outcomes {
                anyhow::ensure!(
                    self.outcomes.iter().any(|o| o.outcome() == name),
                    "outcome {name} is not configured"
                );
            }
            self.outcomes
                .retain(|o| overrides.outcomes.iter().any(|n| n == o.outcome()));
        }
        Ok(self)
    }

    pub fn outcome_names(&self) -> Vec<String> {
        self.outcomes.iter().map(|o| o.outcome().to_string()).collect()
    }

    pub fn open_store(&self) -> Result<ResultStore> {
        let root = &self.config.store.root;
        ResultStore::open(root).with_context(|| format!("open result store {}", root.display()))
    }

    pub fn load_imputations(&self) -> Result<Vec<ImputedDataset>> {
        let dir = &self.config.data.directory;
        let span = info_span!("ingest", directory = %dir.display());
        let _guard = span.enter();
        let options = LoadOptions {
            id_columns: self.config.data.id_columns.clone(),
            ..LoadOptions::default()
        }
        .with_outcomes(self.outcome_names());
        let datasets = load_imputations(dir, &options)
            .with_context(|| format!("load imputed datasets from {}", dir.display()))?;
        info!(imputations = datasets.len(), "datasets loaded");
        Ok(datasets)
    }

    pub fn bridge(&self) -> Bridge<RscriptEngine> {
        Bridge::new(self.engine())
            .with_timeout(Duration::from_secs(self.config.engine.timeout_secs))
    }

    pub fn engine(&self) -> RscriptEngine {
        RscriptEngine::new(&self.config.engine.rscript)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            workers: self.config.engine.workers,
            harmonize: self.config.pooling.harmonize_ladder,
            thresholds: self.config.diagnostics.clone(),
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            complete_df: self.config.pooling.complete_df,
            total_imputations: None,
        }
    }

    pub fn stability_rule(&self) -> StabilityRule {
        StabilityRule {
            threshold: self.config.sensitivity.threshold,
            flag_sign_change: self.config.sensitivity.flag_sign_change,
        }
    }
}

/// Pooling result of one outcome.
#[derive(Debug, Clone)]
pub struct PoolOutcome {
    pub outcome: String,
    pub result: std::result::Result<PooledResult, PoolingFailure>,
}

/// Pools every outcome from its stored cells, saves the successes and
/// rewrites the CSV export.
pub fn pool_store(
    store: &ResultStore,
    outcomes: &[OutcomeSpec],
    options: &PoolOptions,
) -> Result<Vec<PoolOutcome>> {
    let mut pooled = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        let name = outcome.outcome();
        let _span = info_span!("outcome", outcome = name).entered();
        let records = store
            .cells_for(name, &outcome.id())
            .with_context(|| format!("read cell records for {name}"))?;
        let result = pool_records(&records, options);
        match &result {
            Ok(result) => {
                store
                    .save_pooled(result)
                    .with_context(|| format!("save pooled result for {name}"))?;
                info!(outcome = name, coefficients = result.coefficients.len(), "pooled");
            }
            Err(failure) => warn!(outcome = name, %failure, "could not pool"),
        }
        pooled.push(PoolOutcome {
            outcome: name.to_string(),
            result,
        });
    }
    let successes: Vec<PooledResult> = pooled
        .iter()
        .filter_map(|p| p.result.as_ref().ok().cloned())
        .collect();
    let path = store
        .write_pooled_csv(&successes)
        .context("write pooled estimates CSV")?;
    info!(path = %path.display(), rows = successes.len(), "pooled estimates written");
    Ok(pooled)
}

/// Stored cells of one (outcome, model spec) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub outcome: String,
    pub model_spec_id: ModelSpecId,
    pub converged: usize,
    pub with_warning: usize,
    pub abandoned: usize,
    pub ladder_states: BTreeSet<LadderState>,
    pub pooled: bool,
}

impl StatusRow {
    pub fn total(&self) -> usize {
        self.converged + self.with_warning + self.abandoned
    }
}

pub fn store_status(store: &ResultStore) -> Result<Vec<StatusRow>> {
    let mut rows: BTreeMap<(String, ModelSpecId), StatusRow> = BTreeMap::new();
    for record in store.list_cells().context("read cell records")? {
        let (outcome, model_spec_id) = record.key.pool_key();
        let row = rows
            .entry((outcome.clone(), model_spec_id.clone()))
            .or_insert_with(|| StatusRow {
                outcome,
                model_spec_id,
                converged: 0,
                with_warning: 0,
                abandoned: 0,
                ladder_states: BTreeSet::new(),
                pooled: false,
            });
        match record.status {
            CellStatus::Converged => row.converged += 1,
            CellStatus::ConvergedWithWarning => row.with_warning += 1,
            CellStatus::Abandoned => row.abandoned += 1,
        }
        if record.is_success() {
            row.ladder_states.insert(record.final_state);
        }
    }
    for row in rows.values_mut() {
        row.pooled = store
            .load_pooled(&row.outcome, &row.model_spec_id)
            .context("read pooled result")?
            .is_some();
    }
    Ok(rows.into_values().collect())
}
