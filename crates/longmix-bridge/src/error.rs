//! Failure taxonomy of one bridge call.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Input crossing the boundary has the wrong type or is incomplete.
    /// Fatal for the call; never retried.
    #[error("data type error in column '{column}': {message}")]
    DataType { column: String, message: String },

    /// Marshaling failed (unsupported dtype or value). Fatal for the call.
    #[error("conversion error: {message}")]
    Conversion { message: String },

    /// The engine did not converge. Recovered by the fallback ladder.
    #[error("engine did not converge: {message}")]
    Convergence { message: String },

    /// The engine is unreachable or crashed. Retried once by the orchestrator.
    #[error("engine failure: {message}")]
    Engine { message: String },

    #[error("fit exceeded the {}s time limit", .limit.as_secs())]
    Timeout { limit: Duration },

    #[error("fit was cancelled")]
    Cancelled,
}

/// How the fallback policy should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Move down the ladder.
    Recoverable,
    /// Retry the same state once.
    Transient,
    /// Stop this cell.
    Fatal,
}

impl BridgeError {
    pub(crate) fn data_type(column: &str, message: impl Into<String>) -> Self {
        Self::DataType {
            column: column.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Convergence { .. } | Self::Timeout { .. } => ErrorClass::Recoverable,
            Self::Engine { .. } => ErrorClass::Transient,
            Self::DataType { .. } | Self::Conversion { .. } | Self::Cancelled => ErrorClass::Fatal,
        }
    }
}

impl From<polars::prelude::PolarsError> for BridgeError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        Self::Conversion {
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_recoverable_like_convergence() {
        let timeout = BridgeError::Timeout {
            limit: Duration::from_secs(30),
        };
        assert_eq!(timeout.class(), ErrorClass::Recoverable);
        assert_eq!(timeout.to_string(), "fit exceeded the 30s time limit");
        assert_eq!(BridgeError::engine("crash").class(), ErrorClass::Transient);
        assert_eq!(
            BridgeError::data_type("participant_id", "numeric").class(),
            ErrorClass::Fatal
        );
    }
}
