//! Directory-backed result store.
//!
//! Layout under the store root:
//!
//! ```text
//! cells/<outcome>/<spec_id>/imp_<m>.json
//! pooled/<outcome>__<spec_id>.json
//! pooled/pooled_estimates.csv
//! sensitivity/<label>/...          (a nested store per alternate)
//! sensitivity/<label>/comparison.json
//! ```
//!
//! Each cell is its own file, so concurrent workers never contend on a
//! shared file and a re-fit replaces exactly one record.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use longmix_model::{CellKey, CellRecord, ComparisonReport, ModelSpecId, PooledResult};

use crate::envelope::{self, TEMP_SUFFIX};
use crate::error::{Result, StoreError};
use crate::export::pooled_csv;

const CELLS_DIR: &str = "cells";
const POOLED_DIR: &str = "pooled";
const SENSITIVITY_DIR: &str = "sensitivity";
pub const POOLED_CSV: &str = "pooled_estimates.csv";
pub const COMPARISON_FILE: &str = "comparison.json";

const CELL_KIND: &str = "cell";
const POOLED_KIND: &str = "pooled";
const COMPARISON_KIND: &str = "comparison";

#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    /// Opens (creating if needed) a store rooted at `root` and removes
    /// temp files left behind by interrupted writes.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io("create directory", &root, e))?;
        let store = Self { root };
        let removed = store.clean_temp_files()?;
        if removed > 0 {
            tracing::info!(removed, root = %store.root.display(), "removed stale temp files");
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A separate store for one sensitivity alternate. Nothing written there
    /// touches this store's cells or pooled results.
    pub fn namespace(&self, label: &str) -> Result<Self> {
        if label.is_empty()
            || !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(StoreError::invalid_name("namespace", label));
        }
        Self::open(self.root.join(SENSITIVITY_DIR).join(label))
    }

    pub fn cell_path(&self, key: &CellKey) -> PathBuf {
        self.root
            .join(CELLS_DIR)
            .join(&key.outcome)
            .join(key.model_spec_id.as_str())
            .join(format!("imp_{}.json", key.imputation_index))
    }

    pub fn pooled_path(&self, outcome: &str, spec_id: &ModelSpecId) -> PathBuf {
        self.root
            .join(POOLED_DIR)
            .join(format!("{outcome}__{spec_id}.json"))
    }

    pub fn pooled_csv_path(&self) -> PathBuf {
        self.root.join(POOLED_DIR).join(POOLED_CSV)
    }

    pub fn comparison_path(&self) -> PathBuf {
        self.root.join(COMPARISON_FILE)
    }

    /// Writes a cell record, replacing any previous record for its key.
    pub fn save_cell(&self, record: &CellRecord) -> Result<PathBuf> {
        check_outcome(&record.key.outcome)?;
        let path = self.cell_path(&record.key);
        let bytes = envelope::encode(CELL_KIND, record)?;
        envelope::write_atomic(&path, &bytes)?;
        tracing::debug!(cell = %record.key, status = %record.status, "saved cell record");
        Ok(path)
    }

    pub fn load_cell(&self, key: &CellKey) -> Result<Option<CellRecord>> {
        check_outcome(&key.outcome)?;
        let path = self.cell_path(key);
        let record: Option<CellRecord> = envelope::read(CELL_KIND, &path)?;
        match record {
            Some(record) if record.key != *key => Err(StoreError::corrupt(
                &path,
                format!("holds record for {} instead of {key}", record.key),
            )),
            other => Ok(other),
        }
    }

    /// The stored record for `key` if it is a success, which makes the cell
    /// skippable on resume.
    pub fn completed_cell(&self, key: &CellKey) -> Result<Option<CellRecord>> {
        Ok(self.load_cell(key)?.filter(CellRecord::is_success))
    }

    /// Every cell record for one (outcome, primary spec), ordered by
    /// imputation index.
    pub fn cells_for(&self, outcome: &str, spec_id: &ModelSpecId) -> Result<Vec<CellRecord>> {
        check_outcome(outcome)?;
        let dir = self
            .root
            .join(CELLS_DIR)
            .join(outcome)
            .join(spec_id.as_str());
        let mut records = Vec::new();
        for path in json_files(&dir)? {
            if let Some(record) = envelope::read::<CellRecord>(CELL_KIND, &path)? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.key.imputation_index);
        Ok(records)
    }

    /// Every cell record in the store.
    pub fn list_cells(&self) -> Result<Vec<CellRecord>> {
        let cells = self.root.join(CELLS_DIR);
        let mut records = Vec::new();
        for outcome in subdirectories(&cells)? {
            for spec in subdirectories(&outcome)? {
                for path in json_files(&spec)? {
                    if let Some(record) = envelope::read::<CellRecord>(CELL_KIND, &path)? {
                        records.push(record);
                    }
                }
            }
        }
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    pub fn save_pooled(&self, pooled: &PooledResult) -> Result<PathBuf> {
        check_outcome(&pooled.outcome)?;
        let path = self.pooled_path(&pooled.outcome, &pooled.model_spec_id);
        let bytes = envelope::encode(POOLED_KIND, pooled)?;
        envelope::write_atomic(&path, &bytes)?;
        tracing::debug!(
            outcome = %pooled.outcome,
            spec = %pooled.model_spec_id,
            "saved pooled result"
        );
        Ok(path)
    }

    pub fn load_pooled(
        &self,
        outcome: &str,
        spec_id: &ModelSpecId,
    ) -> Result<Option<PooledResult>> {
        check_outcome(outcome)?;
        envelope::read(POOLED_KIND, &self.pooled_path(outcome, spec_id))
    }

    pub fn list_pooled(&self) -> Result<Vec<PooledResult>> {
        let mut results = Vec::new();
        for path in json_files(&self.root.join(POOLED_DIR))? {
            if let Some(pooled) = envelope::read::<PooledResult>(POOLED_KIND, &path)? {
                results.push(pooled);
            }
        }
        results.sort_by(|a, b| {
            (&a.outcome, &a.model_spec_id).cmp(&(&b.outcome, &b.model_spec_id))
        });
        Ok(results)
    }

    /// Writes the flat per-coefficient export of `results`.
    pub fn write_pooled_csv(&self, results: &[PooledResult]) -> Result<PathBuf> {
        let path = self.pooled_csv_path();
        let bytes = pooled_csv(results)?;
        envelope::write_atomic(&path, &bytes)?;
        Ok(path)
    }

    pub fn save_comparison(
        &self,
        reports: &BTreeMap<String, ComparisonReport>,
    ) -> Result<PathBuf> {
        let path = self.comparison_path();
        let bytes = envelope::encode(COMPARISON_KIND, reports)?;
        envelope::write_atomic(&path, &bytes)?;
        Ok(path)
    }

    pub fn load_comparison(&self) -> Result<Option<BTreeMap<String, ComparisonReport>>> {
        envelope::read(COMPARISON_KIND, &self.comparison_path())
    }

    /// Labels of the sensitivity namespaces present under this store.
    pub fn namespaces(&self) -> Result<Vec<String>> {
        let mut labels: Vec<String> = subdirectories(&self.root.join(SENSITIVITY_DIR))?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        labels.sort();
        Ok(labels)
    }

    /// Removes leftover `*.tmp` files anywhere under the root.
    pub fn clean_temp_files(&self) -> Result<usize> {
        remove_temp_files(&self.root)
    }
}

/// Outcome names become directory and file names.
fn check_outcome(outcome: &str) -> Result<()> {
    if outcome.is_empty()
        || outcome == "."
        || outcome == ".."
        || outcome.contains(['/', '\\', '\0'])
    {
        return Err(StoreError::invalid_name("outcome", outcome));
    }
    Ok(())
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io("read", dir, e)),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io("read", dir, e))?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|p| p.is_dir())
        .collect())
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|p| {
            p.is_file()
                && p.extension().is_some_and(|ext| ext == "json")
                && !p
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'))
        })
        .collect())
}

fn remove_temp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for path in read_dir_sorted(dir)? {
        if path.is_dir() {
            removed += remove_temp_files(&path)?;
        } else if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
            fs::remove_file(&path).map_err(|e| StoreError::io("remove", &path, e))?;
            removed += 1;
        }
    }
    Ok(removed)
}
