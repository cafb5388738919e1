//! Checksummed file envelope and atomic writes.
//!
//! Every store file is a one-line header followed by the JSON payload:
//!
//! ```text
//! longmix-store 1 <kind> sha256=<hex digest of payload bytes>
//! { ...payload... }
//! ```
//!
//! The digest covers the exact payload bytes, so a truncated or edited file
//! is detected on load.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

pub const MAGIC: &str = "longmix-store";
pub const FORMAT_VERSION: u32 = 1;
pub const TEMP_SUFFIX: &str = ".tmp";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Serializes `value` into an enveloped file body.
pub(crate) fn encode<T: Serialize>(kind: &'static str, value: &T) -> Result<Vec<u8>> {
    let payload =
        serde_json::to_vec_pretty(value).map_err(|e| StoreError::serialization(kind, e))?;
    let header = format!("{MAGIC} {FORMAT_VERSION} {kind} sha256={}\n", digest(&payload));
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Verifies the envelope and deserializes the payload.
pub(crate) fn decode<T: DeserializeOwned>(kind: &str, bytes: &[u8], path: &Path) -> Result<T> {
    let split = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| StoreError::corrupt(path, "missing header"))?;
    let header = std::str::from_utf8(&bytes[..split])
        .map_err(|_| StoreError::corrupt(path, "header is not UTF-8"))?;
    let payload = &bytes[split + 1..];

    let fields: Vec<&str> = header.split(' ').collect();
    let [magic, version, found_kind, checksum] = fields.as_slice() else {
        return Err(StoreError::corrupt(path, "malformed header"));
    };
    if *magic != MAGIC {
        return Err(StoreError::corrupt(path, "not a longmix store file"));
    }
    if version.parse::<u32>().ok() != Some(FORMAT_VERSION) {
        return Err(StoreError::corrupt(
            path,
            format!("unsupported format version {version}"),
        ));
    }
    if *found_kind != kind {
        return Err(StoreError::corrupt(
            path,
            format!("expected a {kind} file, found {found_kind}"),
        ));
    }
    let expected = checksum
        .strip_prefix("sha256=")
        .ok_or_else(|| StoreError::corrupt(path, "missing checksum"))?;
    if digest(payload) != expected {
        return Err(StoreError::corrupt(path, "checksum mismatch"));
    }

    serde_json::from_slice(payload)
        .map_err(|e| StoreError::corrupt(path, format!("invalid {kind} payload: {e}")))
}

/// Writes `bytes` to `path` through a temp file in the same directory.
///
/// The temp file is synced before the rename, so readers see either the
/// previous file or the complete new one.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::corrupt(path, "path has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|e| StoreError::io("create directory", parent, e))?;

    let temp_path = temp_path_for(path);
    let mut file =
        File::create(&temp_path).map_err(|e| StoreError::io("create", &temp_path, e))?;
    file.write_all(bytes)
        .map_err(|e| StoreError::io("write", &temp_path, e))?;
    file.sync_all()
        .map_err(|e| StoreError::io("sync", &temp_path, e))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::AtomicWriteFailed {
            temp_path,
            target_path: path.to_path_buf(),
            source,
        });
    }
    tracing::trace!(path = %path.display(), bytes = bytes.len(), "wrote store file");
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{n}{TEMP_SUFFIX}", std::process::id()))
}

/// Reads and decodes `path`, or `None` if it does not exist.
pub(crate) fn read<T: DeserializeOwned>(kind: &str, path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => decode(kind, &bytes, path).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io("read", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn envelope_detects_tampering() {
        let bytes = encode("pooled", &vec![1.5_f64, 2.5]).unwrap();
        let path = Path::new("x.json");
        let decoded: Vec<f64> = decode("pooled", &bytes, path).unwrap();
        assert_eq!(decoded, vec![1.5, 2.5]);

        let mut tampered = bytes.clone();
        let last = tampered.len() - 3;
        tampered[last] = b'9';
        assert!(matches!(
            decode::<Vec<f64>>("pooled", &tampered, path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn wrong_kind_is_corrupt() {
        let bytes = encode("pooled", &1_u32).unwrap();
        let err = decode::<u32>("cell", &bytes, Path::new("x.json")).unwrap_err();
        assert!(err.to_string().contains("expected a cell file"));
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("value.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let value: Option<u32> = read("cell", &dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());
    }
}
