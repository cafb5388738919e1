//! Persistent storage for longmix runs.
//!
//! One file per cell record, one per pooled result, plus a CSV export and
//! per-alternate namespaces for sensitivity runs. All writes go through a
//! temp file, `fsync` and rename; every file carries a SHA-256 digest of its
//! payload so damaged files are reported instead of silently reused.
//!
//! # File Format
//!
//! ```text
//! longmix-store 1 cell sha256=9f2c...
//! { "key": { ... }, "status": "converged", ... }
//! ```

mod envelope;
mod error;
mod export;
mod store;

pub use envelope::{FORMAT_VERSION, MAGIC};
pub use error::{Result, StoreError};
pub use store::{COMPARISON_FILE, POOLED_CSV, ResultStore};
