//! Sensitivity analysis: re-run the analysis under an alternate
//! configuration and compare pooled estimates against the baseline.
//!
//! Alternate runs write to `sensitivity/<label>/` inside the baseline
//! store, so baseline cells and pooled results are never touched.

use std::borrow::Cow;
use std::collections::BTreeMap;

use longmix_bridge::{Bridge, FittingEngine};
use longmix_ingest::exclude_outliers;
use longmix_model::{
    Alternate, CoefficientComparison, ComparisonReport, ImputedDataset, OutcomeSpec,
    PooledResult,
};
use longmix_store::ResultStore;
use tracing::{info, info_span, warn};

use crate::error::Result;
use crate::orchestrator::{Orchestrator, RunOptions, RunReport};
use crate::pool::{PoolOptions, PoolingFailure, pool_records};

/// When a coefficient counts as unstable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilityRule {
    /// Largest tolerated |relative change| against the baseline.
    pub threshold: f64,
    pub flag_sign_change: bool,
}

impl Default for StabilityRule {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            flag_sign_change: true,
        }
    }
}

impl StabilityRule {
    pub fn compare_coefficient(
        &self,
        name: &str,
        baseline: f64,
        alternate: f64,
    ) -> CoefficientComparison {
        let difference = alternate - baseline;
        let relative_change = (baseline != 0.0).then(|| difference / baseline.abs());
        let sign_changed =
            baseline != 0.0 && alternate != 0.0 && baseline.signum() != alternate.signum();
        let unstable = (self.flag_sign_change && sign_changed)
            || relative_change.is_some_and(|r| r.abs() > self.threshold);
        CoefficientComparison {
            name: name.to_string(),
            baseline,
            alternate,
            difference,
            relative_change,
            sign_changed,
            unstable,
        }
    }
}

/// Compares two pooled results for one outcome.
pub fn compare_pooled(
    label: &str,
    baseline: &PooledResult,
    alternate: &PooledResult,
    rule: &StabilityRule,
) -> ComparisonReport {
    let base = baseline.pooled_estimates();
    let alt = alternate.pooled_estimates();
    let coefficients = base
        .iter()
        .filter_map(|(name, b)| alt.get(name).map(|a| rule.compare_coefficient(name, *b, *a)))
        .collect();
    ComparisonReport {
        outcome: baseline.outcome.clone(),
        label: label.to_string(),
        baseline_spec_id: Some(baseline.model_spec_id.clone()),
        alternate_spec_id: Some(alternate.model_spec_id.clone()),
        coefficients,
        baseline_only: base.keys().filter(|n| !alt.contains_key(*n)).cloned().collect(),
        alternate_only: alt.keys().filter(|n| !base.contains_key(*n)).cloned().collect(),
        alternate_failure: None,
    }
}

/// Result of one alternate run.
#[derive(Debug)]
pub struct SensitivityRun {
    pub label: String,
    pub reports: BTreeMap<String, ComparisonReport>,
    pub runs: Vec<RunReport>,
    pub store: ResultStore,
}

impl SensitivityRun {
    pub fn unstable_outcomes(&self) -> impl Iterator<Item = &str> {
        self.reports
            .values()
            .filter(|r| r.any_unstable())
            .map(|r| r.outcome.as_str())
    }
}

pub struct SensitivityController<'a, E> {
    bridge: &'a Bridge<E>,
    baseline: &'a ResultStore,
    run_options: RunOptions,
    pool_options: PoolOptions,
    rule: StabilityRule,
    /// Outlier flag column pattern; `{outcome}` is substituted.
    outlier_pattern: String,
}

impl<'a, E: FittingEngine> SensitivityController<'a, E> {
    pub fn new(
        bridge: &'a Bridge<E>,
        baseline: &'a ResultStore,
        run_options: RunOptions,
        pool_options: PoolOptions,
    ) -> Self {
        Self {
            bridge,
            baseline,
            run_options,
            pool_options,
            rule: StabilityRule::default(),
            outlier_pattern: "{outcome}_outlier".to_string(),
        }
    }

    pub fn with_rule(mut self, rule: StabilityRule) -> Self {
        self.rule = rule;
        self
    }

    pub fn with_outlier_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.outlier_pattern = pattern.into();
        self
    }

    /// Compares baseline and alternate pooled results, outcome by outcome.
    ///
    /// Outcomes whose alternate could not be pooled get a report that
    /// carries the failure and lists every baseline coefficient as
    /// baseline-only.
    pub fn compare(
        &self,
        label: &str,
        baseline: &BTreeMap<String, PooledResult>,
        alternate: &BTreeMap<String, std::result::Result<PooledResult, PoolingFailure>>,
    ) -> BTreeMap<String, ComparisonReport> {
        let mut reports = BTreeMap::new();
        for (outcome, alt) in alternate {
            let report = match (baseline.get(outcome), alt) {
                (Some(base), Ok(alt)) => compare_pooled(label, base, alt, &self.rule),
                (base, alt) => ComparisonReport {
                    outcome: outcome.clone(),
                    label: label.to_string(),
                    baseline_spec_id: base.map(|b| b.model_spec_id.clone()),
                    alternate_spec_id: alt.as_ref().ok().map(|a| a.model_spec_id.clone()),
                    coefficients: Vec::new(),
                    baseline_only: base
                        .map(|b| b.pooled_estimates().into_keys().collect())
                        .unwrap_or_default(),
                    alternate_only: alt
                        .as_ref()
                        .map(|a| a.pooled_estimates().into_keys().collect())
                        .unwrap_or_default(),
                    alternate_failure: alt.as_ref().err().map(ToString::to_string),
                },
            };
            reports.insert(outcome.clone(), report);
        }
        reports
    }

    /// Re-drives fitting and pooling under `alternate` and compares every
    /// outcome against the baseline store.
    pub fn run(
        &self,
        alternate: &Alternate,
        outcomes: &[OutcomeSpec],
        imputations: &[ImputedDataset],
    ) -> Result<SensitivityRun> {
        let span = info_span!("sensitivity", label = %alternate.label);
        let _guard = span.enter();
        let store = self.baseline.namespace(&alternate.label)?;
        let orchestrator = Orchestrator::new(self.bridge, &store, self.run_options.clone());

        let mut baseline_pooled = BTreeMap::new();
        let mut alternate_pooled = BTreeMap::new();
        let mut runs = Vec::new();
        for outcome in outcomes {
            let name = outcome.outcome();
            let spec = match &alternate.random_effects {
                Some(random) => OutcomeSpec::new(outcome.primary().with_random(random.clone())),
                None => outcome.clone(),
            };
            let datasets: Cow<'_, [ImputedDataset]> = if alternate.exclude_outliers {
                Cow::Owned(
                    imputations
                        .iter()
                        .map(|d| exclude_outliers(d, name, &self.outlier_pattern))
                        .collect::<std::result::Result<Vec<_>, _>>()?,
                )
            } else {
                Cow::Borrowed(imputations)
            };

            let run = orchestrator.run(std::slice::from_ref(&spec), &datasets)?;
            let pooled = pool_records(&run.records_for(name, &spec.id()), &self.pool_options);
            match &pooled {
                Ok(result) => {
                    store.save_pooled(result)?;
                }
                Err(failure) => warn!(outcome = name, %failure, "alternate could not be pooled"),
            }
            alternate_pooled.insert(name.to_string(), pooled);
            runs.push(run);

            if let Some(base) = self.baseline_pooled(outcome)? {
                baseline_pooled.insert(name.to_string(), base);
            }
        }

        let pooled_ok: Vec<PooledResult> =
            alternate_pooled.values().filter_map(|p| p.as_ref().ok().cloned()).collect();
        store.write_pooled_csv(&pooled_ok)?;

        let reports = self.compare(&alternate.label, &baseline_pooled, &alternate_pooled);
        store.save_comparison(&reports)?;
        let unstable = reports.values().filter(|r| r.any_unstable()).count();
        info!(outcomes = reports.len(), unstable, "sensitivity comparison complete");

        Ok(SensitivityRun {
            label: alternate.label.clone(),
            reports,
            runs,
            store,
        })
    }

    /// Pools the baseline cells as they are now. A saved pooled file may
    /// predate later baseline runs, so it is never read here.
    fn baseline_pooled(&self, outcome: &OutcomeSpec) -> Result<Option<PooledResult>> {
        let records = self.baseline.cells_for(outcome.outcome(), &outcome.id())?;
        match pool_records(&records, &self.pool_options) {
            Ok(pooled) => Ok(Some(pooled)),
            Err(failure) => {
                warn!(outcome = outcome.outcome(), %failure, "baseline could not be pooled");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_flip_is_unstable_even_when_small() {
        let rule = StabilityRule::default();
        let c = rule.compare_coefficient("time", 0.01, -0.001);
        assert!(c.sign_changed);
        assert!(c.unstable);

        let lenient = StabilityRule {
            flag_sign_change: false,
            threshold: 2.0,
        };
        assert!(!lenient.compare_coefficient("time", 0.01, -0.001).unstable);
    }

    #[test]
    fn relative_change_against_threshold() {
        let rule = StabilityRule::default();
        let small = rule.compare_coefficient("b", 2.0, 2.5);
        assert_eq!(small.relative_change, Some(0.25));
        assert!(!small.unstable);
        let large = rule.compare_coefficient("b", -2.0, -3.2);
        assert!(large.relative_change.unwrap() < -0.5);
        assert!(large.unstable);
    }

    #[test]
    fn zero_baseline_has_no_relative_change() {
        let c = StabilityRule::default().compare_coefficient("b", 0.0, 1.0);
        assert_eq!(c.relative_change, None);
        assert!(!c.sign_changed);
        assert!(!c.unstable);
    }
}
