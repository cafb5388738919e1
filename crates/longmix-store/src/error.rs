//! Store error types.
//!
//! Store failures abort a run, so every error carries a user-facing message
//! and, where one exists, a remediation hint.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// File I/O error.
    #[error("Failed to {operation} {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File exists but its header, digest or payload is not valid.
    #[error("Corrupt store file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to serialize {what}")]
    Serialization {
        what: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A name that cannot be used as a single path component.
    #[error("Invalid {kind} name '{name}'")]
    InvalidName { kind: &'static str, name: String },

    /// Temp file was written but could not be moved into place.
    #[error("Failed to complete write of {target_path}")]
    AtomicWriteFailed {
        temp_path: PathBuf,
        target_path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_name(kind: &'static str, name: impl Into<String>) -> Self {
        Self::InvalidName {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn serialization(
        what: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            what,
            source: Box::new(source),
        }
    }

    /// Get a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::Io {
                operation, path, ..
            } => format!("Could not {} {}", operation, path.display()),
            Self::Corrupt { path, reason } => format!(
                "The result file {} is damaged ({}).",
                path.display(),
                reason
            ),
            Self::Serialization { what, .. } => {
                format!("An error occurred while encoding the {what}.")
            }
            Self::InvalidName { kind, name } => {
                format!("'{name}' cannot be used as a {kind} name in the result store.")
            }
            Self::AtomicWriteFailed { target_path, .. } => format!(
                "Could not save {}. Please check disk space and permissions.",
                target_path.display()
            ),
        }
    }

    /// Get a suggestion for how to resolve this error.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Io { operation, .. } => {
                if *operation == "read" {
                    Some("Check that the store directory exists and is readable.".into())
                } else {
                    Some("Check that you have permission to write to the store directory.".into())
                }
            }
            Self::Corrupt { .. } => Some(
                "Delete the damaged file and re-run; the affected cell will be fitted again."
                    .into(),
            ),
            Self::Serialization { .. } => None,
            Self::InvalidName { .. } => Some(
                "Use a name made of letters, digits, '.', '-' or '_' that is not '.' or '..'."
                    .into(),
            ),
            Self::AtomicWriteFailed { .. } => {
                Some("Free up disk space or point [store] root at a different location.".into())
            }
        }
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
