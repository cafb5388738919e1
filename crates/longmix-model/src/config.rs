//! Analysis configuration loaded from TOML.
//!
//! Every formula is parsed and validated once at load time; downstream code
//! only ever sees [`OutcomeSpec`] values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::formula::{RandomTerm, parse_random_effects};
use crate::spec::{Family, Link, ModelSpec, OutcomeSpec};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub engine: EngineSettings,
    pub store: StoreSettings,
    pub data: DataSettings,
    pub pooling: PoolingSettings,
    pub diagnostics: DiagnosticThresholds,
    pub sensitivity: SensitivitySettings,
    pub outcomes: Vec<OutcomeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Path or name of the `Rscript` executable.
    pub rscript: PathBuf,
    pub timeout_secs: u64,
    /// Worker threads; 0 uses the available parallelism.
    pub workers: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rscript: PathBuf::from("Rscript"),
            timeout_secs: 600,
            workers: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    pub root: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("longmix-results"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataSettings {
    /// Directory holding the M imputed CSV files.
    pub directory: PathBuf,
    pub id_columns: Vec<String>,
    /// Per-outcome outlier flag column; `{outcome}` is substituted.
    pub outlier_column: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/imputed"),
            id_columns: vec![
                crate::dataset::REPLICATE_COLUMN.to_string(),
                crate::dataset::PARTICIPANT_COLUMN.to_string(),
                crate::dataset::TREATMENT_COLUMN.to_string(),
            ],
            outlier_column: "{outcome}_outlier".to_string(),
        }
    }
}

impl DataSettings {
    pub fn outlier_column_for(&self, outcome: &str) -> String {
        self.outlier_column.replace("{outcome}", outcome)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolingSettings {
    /// Overrides the complete-data degrees of freedom taken from the fits.
    pub complete_df: Option<f64>,
    /// Re-fit richer cells at the simplest ladder state reached by an outcome.
    pub harmonize_ladder: bool,
}

impl Default for PoolingSettings {
    fn default() -> Self {
        Self {
            complete_df: None,
            harmonize_ladder: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticThresholds {
    /// Significance level for the normality and homogeneity tests.
    pub alpha: f64,
    pub max_vif: f64,
    /// Random-effect variance at or below this fraction of the residual
    /// variance counts as a boundary estimate.
    pub singular_tolerance: f64,
    pub correlation_bound: f64,
    /// Fewer residuals than this skips the distributional tests.
    pub min_residuals: usize,
}

impl Default for DiagnosticThresholds {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            max_vif: 10.0,
            singular_tolerance: 1e-4,
            correlation_bound: 0.999,
            min_residuals: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensitivitySettings {
    /// Relative change in a pooled estimate above which it is unstable.
    pub threshold: f64,
    pub flag_sign_change: bool,
    pub alternates: Vec<AlternateEntry>,
}

impl Default for SensitivitySettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            flag_sign_change: true,
            alternates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlternateEntry {
    pub label: String,
    #[serde(default)]
    pub exclude_outliers: bool,
    /// Replacement random-effects structure, e.g. `(1 | participant_id)`.
    #[serde(default)]
    pub random_effects: Option<String>,
}

/// A validated alternate configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alternate {
    pub label: String,
    pub exclude_outliers: bool,
    pub random_effects: Option<Vec<RandomTerm>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutcomeEntry {
    pub name: String,
    #[serde(default = "default_family")]
    pub family: Family,
    #[serde(default)]
    pub link: Option<Link>,
    pub formula: String,
    #[serde(default)]
    pub fallback_formulas: Vec<String>,
}

fn default_family() -> Family {
    Family::Gaussian
}

impl AnalysisConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ModelError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ModelError::ConfigToml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|source| ModelError::ConfigToml {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Parses every outcome entry into an [`OutcomeSpec`], keyed by outcome.
    pub fn outcome_specs(&self) -> Result<BTreeMap<String, OutcomeSpec>> {
        if self.outcomes.is_empty() {
            return Err(ModelError::InvalidConfig(
                "at least one [[outcomes]] entry is required".to_string(),
            ));
        }
        let mut out = BTreeMap::new();
        for entry in &self.outcomes {
            let primary = ModelSpec::parse(&entry.formula, entry.family, entry.link)?;
            if primary.outcome() != entry.name {
                return Err(ModelError::InvalidConfig(format!(
                    "outcome {} has formula for response {}",
                    entry.name,
                    primary.outcome()
                )));
            }
            let fallbacks = entry
                .fallback_formulas
                .iter()
                .map(|text| ModelSpec::parse(text, entry.family, entry.link))
                .collect::<Result<Vec<_>>>()?;
            let spec = OutcomeSpec::with_fallbacks(primary, fallbacks)?;
            if out.insert(entry.name.clone(), spec).is_some() {
                return Err(ModelError::InvalidConfig(format!(
                    "outcome {} is configured twice",
                    entry.name
                )));
            }
        }
        Ok(out)
    }

    pub fn alternates(&self) -> Result<Vec<Alternate>> {
        let mut labels: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        for entry in &self.sensitivity.alternates {
            if entry.label.trim().is_empty()
                || !entry
                    .label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(ModelError::InvalidConfig(format!(
                    "sensitivity label {:?} must be non-empty and use [A-Za-z0-9_-]",
                    entry.label
                )));
            }
            if labels.contains(&entry.label.as_str()) {
                return Err(ModelError::InvalidConfig(format!(
                    "sensitivity label {} is used twice",
                    entry.label
                )));
            }
            labels.push(&entry.label);
            let random_effects = entry
                .random_effects
                .as_deref()
                .map(parse_random_effects)
                .transpose()?;
            out.push(Alternate {
                label: entry.label.clone(),
                exclude_outliers: entry.exclude_outliers,
                random_effects,
            });
        }
        Ok(out)
    }

    /// Full validation: outcomes, alternates and numeric thresholds.
    pub fn validate(&self) -> Result<BTreeMap<String, OutcomeSpec>> {
        let specs = self.outcome_specs()?;
        self.alternates()?;
        let d = &self.diagnostics;
        if d.alpha <= 0.0 || d.alpha >= 1.0 {
            return Err(ModelError::InvalidConfig(format!(
                "diagnostics.alpha must be in (0, 1), got {}",
                d.alpha
            )));
        }
        if d.max_vif < 1.0 {
            return Err(ModelError::InvalidConfig(format!(
                "diagnostics.max_vif must be >= 1, got {}",
                d.max_vif
            )));
        }
        if self.sensitivity.threshold <= 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "sensitivity.threshold must be positive, got {}",
                self.sensitivity.threshold
            )));
        }
        if let Some(df) = self.pooling.complete_df
            && df <= 0.0
        {
            return Err(ModelError::InvalidConfig(format!(
                "pooling.complete_df must be positive, got {df}"
            )));
        }
        if self.engine.timeout_secs == 0 {
            return Err(ModelError::InvalidConfig(
                "engine.timeout_secs must be positive".to_string(),
            ));
        }
        Ok(specs)
    }
}
