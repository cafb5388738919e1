//! Batch orchestration over {outcome × model spec × imputation}.
//!
//! Cells run on a dedicated rayon pool. Each fit opens its own engine
//! session through the bridge, so workers never share engine state. The
//! store is the only shared resource and every cell owns its own file.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use longmix_bridge::{Bridge, FittingEngine};
use longmix_model::{
    CellKey, CellRecord, CellStatus, DiagnosticThresholds, ImputedDataset, LadderState,
    ModelSpecId, OutcomeSpec,
};
use longmix_store::ResultStore;
use rayon::prelude::*;
use tracing::{info, info_span, warn};

use crate::error::{CoreError, Result};
use crate::fallback::fit_cell;

/// Harmonization rounds are bounded by the number of ladder states.
const MAX_HARMONIZE_ROUNDS: usize = 3;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker threads; 0 uses the available parallelism.
    pub workers: usize,
    /// Re-fit cells so each (outcome, model) ends at one ladder state.
    pub harmonize: bool,
    pub thresholds: DiagnosticThresholds,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            harmonize: true,
            thresholds: DiagnosticThresholds::default(),
        }
    }
}

/// How a cell's record came to be in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOrigin {
    Fitted,
    /// A successful record already in the store.
    Resumed,
    /// Re-fitted at a simpler state to match its siblings.
    Harmonized,
}

#[derive(Debug, Clone)]
pub struct CellEntry {
    pub record: CellRecord,
    pub origin: CellOrigin,
}

/// Every cell of a run with its terminal record.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub cells: BTreeMap<CellKey, CellEntry>,
    pub duration: Duration,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.cells.len()
    }

    pub fn count_status(&self, status: CellStatus) -> usize {
        self.cells
            .values()
            .filter(|e| e.record.status == status)
            .count()
    }

    pub fn count_origin(&self, origin: CellOrigin) -> usize {
        self.cells.values().filter(|e| e.origin == origin).count()
    }

    pub fn records(&self) -> impl Iterator<Item = &CellRecord> {
        self.cells.values().map(|e| &e.record)
    }

    /// Records of one (outcome, primary spec), ordered by imputation index.
    pub fn records_for(&self, outcome: &str, spec_id: &ModelSpecId) -> Vec<CellRecord> {
        self.records()
            .filter(|r| r.key.outcome == outcome && r.key.model_spec_id == *spec_id)
            .cloned()
            .collect()
    }
}

/// Ensures at most one live attempt per cell key.
#[derive(Debug, Default)]
struct InFlight {
    keys: Mutex<HashSet<CellKey>>,
}

struct InFlightGuard<'a> {
    registry: &'a InFlight,
    key: CellKey,
}

impl InFlight {
    fn claim(&self, key: &CellKey) -> Option<InFlightGuard<'_>> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.insert(key.clone()).then(|| InFlightGuard {
            registry: self,
            key: key.clone(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

struct CellJob<'a> {
    key: CellKey,
    outcome: &'a OutcomeSpec,
    dataset: &'a ImputedDataset,
    start: LadderState,
    previous: Option<CellRecord>,
}

type ProgressFn = dyn Fn(&CellRecord) + Send + Sync;

pub struct Orchestrator<'a, E> {
    bridge: &'a Bridge<E>,
    store: &'a ResultStore,
    options: RunOptions,
    in_flight: InFlight,
    progress: Option<Box<ProgressFn>>,
}

impl<'a, E: FittingEngine> Orchestrator<'a, E> {
    pub fn new(bridge: &'a Bridge<E>, store: &'a ResultStore, options: RunOptions) -> Self {
        Self {
            bridge,
            store,
            options,
            in_flight: InFlight::default(),
            progress: None,
        }
    }

    /// Called once per cell when it first reaches a terminal record.
    pub fn with_progress(
        mut self,
        progress: impl Fn(&CellRecord) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn store(&self) -> &ResultStore {
        self.store
    }

    /// Number of cells a run over these inputs covers.
    pub fn cell_count(outcomes: &[OutcomeSpec], imputations: &[ImputedDataset]) -> usize {
        enumerate(outcomes, imputations).len()
    }

    /// Fits every cell not already completed in the store.
    ///
    /// Cell failures end up in the report; only store errors abort.
    pub fn run(
        &self,
        outcomes: &[OutcomeSpec],
        imputations: &[ImputedDataset],
    ) -> Result<RunReport> {
        if imputations.is_empty() {
            return Err(CoreError::NoImputations);
        }
        let started = Instant::now();
        let span = info_span!(
            "run",
            store = %self.store.root().display(),
            outcomes = outcomes.len(),
            imputations = imputations.len()
        );
        let _guard = span.enter();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .thread_name(|i| format!("longmix-worker-{i}"))
            .build()?;

        let mut report = RunReport::default();
        let mut jobs = Vec::new();
        for (key, (outcome, dataset)) in enumerate(outcomes, imputations) {
            match self.store.completed_cell(&key)? {
                Some(record) => {
                    self.notify(&record);
                    report.cells.insert(
                        key,
                        CellEntry {
                            record,
                            origin: CellOrigin::Resumed,
                        },
                    );
                }
                None => jobs.push(CellJob {
                    start: outcome.initial_state(),
                    key,
                    outcome,
                    dataset,
                    previous: None,
                }),
            }
        }
        info!(
            pending = jobs.len(),
            resumed = report.cells.len(),
            workers = pool.current_num_threads(),
            "starting cells"
        );

        for (key, record) in self.execute(&pool, jobs)? {
            report.cells.insert(
                key,
                CellEntry {
                    record,
                    origin: CellOrigin::Fitted,
                },
            );
        }

        if self.options.harmonize {
            self.harmonize(&pool, outcomes, imputations, &mut report)?;
        }

        report.duration = started.elapsed();
        info!(
            cells = report.total(),
            converged = report.count_status(CellStatus::Converged),
            with_warning = report.count_status(CellStatus::ConvergedWithWarning),
            abandoned = report.count_status(CellStatus::Abandoned),
            duration_ms = report.duration.as_millis(),
            "run complete"
        );
        Ok(report)
    }

    fn execute(
        &self,
        pool: &rayon::ThreadPool,
        jobs: Vec<CellJob<'_>>,
    ) -> Result<Vec<(CellKey, CellRecord)>> {
        let results: Vec<Result<Option<(CellKey, CellRecord)>>> =
            pool.install(|| jobs.into_par_iter().map(|job| self.run_job(job)).collect());
        let mut done = Vec::with_capacity(results.len());
        for result in results {
            if let Some(entry) = result? {
                done.push(entry);
            }
        }
        Ok(done)
    }

    fn run_job(&self, job: CellJob<'_>) -> Result<Option<(CellKey, CellRecord)>> {
        let Some(_claim) = self.in_flight.claim(&job.key) else {
            warn!(cell = %job.key, "cell already in flight; skipping duplicate");
            return Ok(None);
        };
        let span = info_span!(
            "cell",
            outcome = %job.key.outcome,
            imputation = job.key.imputation_index,
            state = %job.start
        );
        let _guard = span.enter();

        let history = job
            .previous
            .as_ref()
            .map(|r| r.attempts.clone())
            .unwrap_or_default();
        let record = fit_cell(
            self.bridge,
            job.outcome,
            job.dataset,
            &job.key,
            job.start,
            &self.options.thresholds,
            history,
        );

        let harmonizing = job.previous.is_some();
        let record = match job.previous {
            // A failed harmonization keeps the richer successful fit.
            Some(previous) if !record.is_success() => {
                warn!(
                    cell = %job.key,
                    target = %job.start,
                    "harmonized re-fit failed; keeping previous fit"
                );
                previous
            }
            _ => {
                self.store.save_cell(&record)?;
                record
            }
        };
        info!(
            status = %record.status,
            final_state = %record.final_state,
            attempts = record.attempt_count(),
            "cell finished"
        );
        if !harmonizing {
            self.notify(&record);
        }
        Ok(Some((job.key, record)))
    }

    /// Re-fits successful cells that stopped at a richer ladder state than
    /// their siblings, so each (outcome, model) pools one random structure.
    fn harmonize(
        &self,
        pool: &rayon::ThreadPool,
        outcomes: &[OutcomeSpec],
        imputations: &[ImputedDataset],
        report: &mut RunReport,
    ) -> Result<()> {
        let cells = enumerate(outcomes, imputations);
        let mut kept: HashSet<CellKey> = HashSet::new();
        for round in 1..=MAX_HARMONIZE_ROUNDS {
            let mut targets: BTreeMap<(String, ModelSpecId), LadderState> = BTreeMap::new();
            let mut states: BTreeMap<(String, ModelSpecId), BTreeSet<LadderState>> =
                BTreeMap::new();
            for record in report.records().filter(|r| r.is_success()) {
                let pool_key = record.key.pool_key();
                states
                    .entry(pool_key.clone())
                    .or_default()
                    .insert(record.final_state);
                let target = targets.entry(pool_key).or_insert(record.final_state);
                *target = (*target).max(record.final_state);
            }

            let mut jobs = Vec::new();
            for (key, entry) in &report.cells {
                let pool_key = key.pool_key();
                let mixed = states.get(&pool_key).is_some_and(|s| s.len() > 1);
                let Some(target) = targets.get(&pool_key).copied() else {
                    continue;
                };
                if !mixed
                    || kept.contains(key)
                    || !entry.record.is_success()
                    || entry.record.final_state >= target
                {
                    continue;
                }
                let Some(&(outcome, dataset)) = cells.get(key) else {
                    continue;
                };
                jobs.push(CellJob {
                    key: key.clone(),
                    outcome,
                    dataset,
                    start: target,
                    previous: Some(entry.record.clone()),
                });
            }
            if jobs.is_empty() {
                return Ok(());
            }

            info!(round, cells = jobs.len(), "harmonizing ladder states");
            for (key, record) in self.execute(pool, jobs)? {
                let changed = report
                    .cells
                    .get(&key)
                    .is_none_or(|e| e.record.final_state != record.final_state);
                if changed {
                    report.cells.insert(
                        key,
                        CellEntry {
                            record,
                            origin: CellOrigin::Harmonized,
                        },
                    );
                } else {
                    kept.insert(key);
                }
            }
        }
        Ok(())
    }

    fn notify(&self, record: &CellRecord) {
        if let Some(progress) = &self.progress {
            progress(record);
        }
    }
}

/// Deduplicated cells, keyed by the outcome's primary spec id.
fn enumerate<'a>(
    outcomes: &'a [OutcomeSpec],
    imputations: &'a [ImputedDataset],
) -> BTreeMap<CellKey, (&'a OutcomeSpec, &'a ImputedDataset)> {
    let mut cells = BTreeMap::new();
    for outcome in outcomes {
        let spec_id = outcome.id();
        for dataset in imputations {
            let key = CellKey::new(outcome.outcome(), spec_id.clone(), dataset.index());
            cells.entry(key).or_insert((outcome, dataset));
        }
    }
    cells
}
