//! Singular (boundary) fit detection.

use longmix_model::FitResult;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundaryCheck {
    pub singular: bool,
    pub min_variance_ratio: Option<f64>,
    pub reasons: Vec<String>,
}

/// Flags a fit as singular when the engine says so, when a random-effect
/// variance is at or below `tolerance` times the residual variance, or when
/// a random-effect correlation reaches `correlation_bound` in magnitude.
///
/// Without a residual variance (non-Gaussian families) the variances are
/// compared against `tolerance` directly.
pub fn boundary_check(fit: &FitResult, tolerance: f64, correlation_bound: f64) -> BoundaryCheck {
    let mut check = BoundaryCheck::default();
    if fit.engine_singular {
        check.singular = true;
        check.reasons.push("engine reported a singular fit".into());
    }

    let scale = fit
        .residual_variance
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(1.0);
    for component in &fit.random_effect_variances {
        let ratio = component.variance / scale;
        check.min_variance_ratio = Some(match check.min_variance_ratio {
            Some(current) => current.min(ratio),
            None => ratio,
        });
        if ratio.is_nan() || ratio <= tolerance {
            check.singular = true;
            check.reasons.push(format!(
                "variance of {} in {} is at the boundary ({:.3e})",
                component.term, component.group, component.variance
            ));
        }
    }

    for correlation in &fit.random_effect_correlations {
        if correlation.correlation.is_nan() || correlation.correlation.abs() >= correlation_bound {
            check.singular = true;
            check.reasons.push(format!(
                "correlation of {} and {} in {} is {:.4}",
                correlation.first, correlation.second, correlation.group, correlation.correlation
            ));
        }
    }
    check
}
