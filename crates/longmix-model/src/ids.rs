use std::fmt;

use serde::{Deserialize, Serialize};

/// Content hash of a [`crate::ModelSpec`], rendered as 16 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelSpecId(String);

impl ModelSpecId {
    /// Builds an id from the first 8 bytes of a SHA-256 digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        let take = digest.len().min(8);
        Self(hex::encode(&digest[..take]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelSpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one unit of work: (outcome, model spec, imputation index).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub outcome: String,
    pub model_spec_id: ModelSpecId,
    pub imputation_index: usize,
}

impl CellKey {
    pub fn new(
        outcome: impl Into<String>,
        model_spec_id: ModelSpecId,
        imputation_index: usize,
    ) -> Self {
        Self {
            outcome: outcome.into(),
            model_spec_id,
            imputation_index,
        }
    }

    /// Key of the (outcome, model) pair this cell pools into.
    pub fn pool_key(&self) -> (String, ModelSpecId) {
        (self.outcome.clone(), self.model_spec_id.clone())
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/m{}",
            self.outcome, self.model_spec_id, self.imputation_index
        )
    }
}
