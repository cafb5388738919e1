use serde::{Deserialize, Serialize};

/// A test statistic with its p-value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestStatistic {
    pub statistic: f64,
    pub p_value: f64,
}

/// Post-fit validity checks attached 1:1 to a fit.
///
/// Only `is_singular_fit` drives the fallback ladder; the other flags are
/// advisory. Checks that could not be computed pass and leave a note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub normality_ok: bool,
    pub homogeneity_ok: bool,
    pub multicollinearity_ok: bool,
    pub is_singular_fit: bool,
    #[serde(default)]
    pub notes: Vec<String>,
    pub jarque_bera: Option<TestStatistic>,
    pub brown_forsythe: Option<TestStatistic>,
    pub max_vif: Option<f64>,
    /// Smallest random-effect variance relative to the residual variance.
    pub min_variance_ratio: Option<f64>,
}

impl Default for DiagnosticsReport {
    fn default() -> Self {
        Self {
            normality_ok: true,
            homogeneity_ok: true,
            multicollinearity_ok: true,
            is_singular_fit: false,
            notes: Vec::new(),
            jarque_bera: None,
            brown_forsythe: None,
            max_vif: None,
            min_variance_ratio: None,
        }
    }
}

impl DiagnosticsReport {
    pub fn all_ok(&self) -> bool {
        self.normality_ok && self.homogeneity_ok && self.multicollinearity_ok && !self.is_singular_fit
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }
}
