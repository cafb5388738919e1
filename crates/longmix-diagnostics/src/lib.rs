//! Post-fit diagnostics for mixed-model fits.
//!
//! [`check`] is pure: it reads a fit and the dataset it was fitted on and
//! returns a [`DiagnosticsReport`]. Only the singular-fit flag feeds the
//! fallback ladder. Normality, homogeneity and multicollinearity are
//! advisory, and a check that cannot be computed passes with a note.

mod boundary;
mod collinearity;
mod homogeneity;
mod normality;

use std::collections::BTreeMap;

use longmix_model::dataset::TREATMENT_COLUMN;
use longmix_model::{
    DiagnosticThresholds, DiagnosticsReport, FitResult, ImputedDataset, TestStatistic,
};
use polars::prelude::DataType;

pub use boundary::{BoundaryCheck, boundary_check};
pub use collinearity::{INTERCEPT, Vif, variance_inflation};
pub use homogeneity::{BrownForsythe, brown_forsythe};
pub use normality::{JarqueBera, jarque_bera};

/// Runs every diagnostic against one fit.
pub fn check(
    fit: &FitResult,
    dataset: &ImputedDataset,
    thresholds: &DiagnosticThresholds,
) -> DiagnosticsReport {
    let mut report = DiagnosticsReport::default();
    let n = fit.residuals.len();

    if n < thresholds.min_residuals {
        report.note(format!(
            "normality and homogeneity not assessed: {n} residuals (minimum {})",
            thresholds.min_residuals
        ));
    } else {
        check_normality(fit, thresholds, &mut report);
        check_homogeneity(fit, dataset, thresholds, &mut report);
    }
    check_collinearity(fit, thresholds, &mut report);

    let boundary = boundary_check(
        fit,
        thresholds.singular_tolerance,
        thresholds.correlation_bound,
    );
    report.is_singular_fit = boundary.singular;
    report.min_variance_ratio = boundary.min_variance_ratio;
    report.notes.extend(boundary.reasons);

    tracing::debug!(
        cell = %fit.cell_key,
        normality = report.normality_ok,
        homogeneity = report.homogeneity_ok,
        multicollinearity = report.multicollinearity_ok,
        singular = report.is_singular_fit,
        "diagnostics"
    );
    report
}

fn check_normality(
    fit: &FitResult,
    thresholds: &DiagnosticThresholds,
    report: &mut DiagnosticsReport,
) {
    match jarque_bera(&fit.residuals) {
        Some(jb) => {
            report.normality_ok = jb.p_value >= thresholds.alpha;
            report.jarque_bera = Some(TestStatistic {
                statistic: jb.statistic,
                p_value: jb.p_value,
            });
        }
        None => report.note("normality not assessed: residuals have no spread"),
    }
}

fn check_homogeneity(
    fit: &FitResult,
    dataset: &ImputedDataset,
    thresholds: &DiagnosticThresholds,
    report: &mut DiagnosticsReport,
) {
    let groups = match residual_groups(fit, dataset) {
        Ok(groups) => groups,
        Err(reason) => {
            report.note(format!("homogeneity not assessed: {reason}"));
            return;
        }
    };
    match brown_forsythe(&groups) {
        Some(bf) => {
            report.homogeneity_ok = bf.p_value >= thresholds.alpha;
            report.brown_forsythe = Some(TestStatistic {
                statistic: bf.statistic,
                p_value: bf.p_value,
            });
        }
        None => report.note("homogeneity not assessed: fewer than two usable treatment groups"),
    }
}

/// Splits residuals by treatment arm. Residuals must align with dataset rows.
fn residual_groups(fit: &FitResult, dataset: &ImputedDataset) -> Result<Vec<Vec<f64>>, String> {
    if fit.residuals.len() != dataset.height() {
        return Err(format!(
            "{} residuals for {} rows",
            fit.residuals.len(),
            dataset.height()
        ));
    }
    let column = dataset
        .frame()
        .column(TREATMENT_COLUMN)
        .and_then(|c| c.cast(&DataType::String))
        .map_err(|e| e.to_string())?;
    let labels = column.str().map_err(|e| e.to_string())?;

    let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for (label, residual) in labels.into_iter().zip(&fit.residuals) {
        if let Some(label) = label {
            groups.entry(label).or_default().push(*residual);
        }
    }
    Ok(groups.into_values().collect())
}

fn check_collinearity(
    fit: &FitResult,
    thresholds: &DiagnosticThresholds,
    report: &mut DiagnosticsReport,
) {
    match variance_inflation(&fit.covariance) {
        Some(vifs) if vifs.is_empty() => {}
        Some(vifs) => {
            let worst = vifs
                .iter()
                .max_by(|a, b| a.value.total_cmp(&b.value))
                .map(|v| (v.name.clone(), v.value));
            if let Some((name, value)) = worst {
                report.max_vif = Some(value);
                report.multicollinearity_ok = value <= thresholds.max_vif;
                if !report.multicollinearity_ok {
                    report.note(format!("VIF of {name} is {value:.1}"));
                }
            }
        }
        None => report.note("multicollinearity not assessed: covariance matrix unusable"),
    }
}
