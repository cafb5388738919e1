//! Run-level errors.
//!
//! Cell-level failures never surface here: they end up in the cell's
//! record. Only problems that make the whole run untrustworthy do.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] longmix_store::StoreError),

    #[error(transparent)]
    Ingest(#[from] longmix_ingest::IngestError),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("no imputed datasets to fit")]
    NoImputations,
}

pub type Result<T> = std::result::Result<T, CoreError>;
