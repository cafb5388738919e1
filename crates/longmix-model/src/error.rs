use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid formula `{formula}` at position {position}: {message}")]
    Formula {
        formula: String,
        position: usize,
        message: String,
    },

    #[error("link {link} is not supported for family {family}")]
    UnsupportedLink { family: String, link: String },

    #[error("invalid outcome name: {0:?}")]
    InvalidOutcome(String),

    #[error("imputation index must be >= 1, got {0}")]
    InvalidImputationIndex(usize),

    #[error(
        "fallback formula for outcome {outcome} is not simpler than its predecessor \
         ({previous} -> {next})"
    )]
    NonMonotoneFallback {
        outcome: String,
        previous: String,
        next: String,
    },

    #[error("fallback formula targets outcome {found}, expected {expected}")]
    FallbackOutcomeMismatch { expected: String, found: String },

    #[error("participant {participant} appears in replicates {first} and {second}")]
    ParticipantNotNested {
        participant: String,
        first: String,
        second: String,
    },

    #[error("participant {participant} has treatments {first} and {second}")]
    TreatmentNotConstant {
        participant: String,
        first: String,
        second: String,
    },

    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("dataframe error: {0}")]
    Frame(#[from] polars::error::PolarsError),
}

impl ModelError {
    pub(crate) fn formula(formula: &str, position: usize, message: impl Into<String>) -> Self {
        Self::Formula {
            formula: formula.to_string(),
            position,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
