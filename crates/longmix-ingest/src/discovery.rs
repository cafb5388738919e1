//! Discovery of the M imputed CSV files in a directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{IngestError, Result};

/// Lists all CSV files in a directory, sorted by filename.
pub fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(IngestError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    let entries = std::fs::read_dir(dir).map_err(|e| IngestError::DirectoryRead {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut files = Vec::new();
    for entry_result in entries {
        let entry = entry_result.map_err(|e| IngestError::DirectoryRead {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv {
            files.push(path);
        }
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Extracts the imputation index from names like `crp_imp3.csv`,
/// `imputation_3.csv` or `imputed-03.csv`.
pub fn imputation_index(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?.to_ascii_lowercase();
    let digits_at = stem.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits_at == stem.len() {
        return None;
    }
    let prefix = stem[..digits_at].trim_end_matches(['_', '-', '.']);
    let tagged = ["imp", "imputation", "imputed"]
        .iter()
        .any(|tag| prefix.ends_with(tag));
    if !tagged {
        return None;
    }
    stem[digits_at..].parse().ok().filter(|index| *index > 0)
}

/// Finds the imputed datasets in `dir`, ordered by index.
///
/// Indices must be unique and contiguous from 1.
pub fn discover_imputations(dir: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut found: BTreeMap<usize, PathBuf> = BTreeMap::new();
    for path in list_csv_files(dir)? {
        let Some(index) = imputation_index(&path) else {
            tracing::debug!(path = %path.display(), "skipping non-imputation CSV");
            continue;
        };
        if let Some(first) = found.get(&index) {
            return Err(IngestError::DuplicateImputation {
                index,
                first: first.clone(),
                second: path,
            });
        }
        found.insert(index, path);
    }

    if found.is_empty() {
        return Err(IngestError::NoImputations {
            path: dir.to_path_buf(),
        });
    }
    for (expected, index) in (1..).zip(found.keys()) {
        if *index != expected {
            return Err(IngestError::ImputationGap { missing: expected });
        }
    }
    Ok(found.into_iter().collect())
}
