//! Variance inflation factors from the fixed-effect covariance matrix.
//!
//! For a fitted model the VIF of coefficient j is the j-th diagonal element
//! of the inverse of the coefficient correlation matrix, with the intercept
//! removed. This needs only the covariance the engine returns.

use longmix_model::CovarianceMatrix;
use nalgebra::DMatrix;

pub const INTERCEPT: &str = "(Intercept)";

#[derive(Debug, Clone, PartialEq)]
pub struct Vif {
    pub name: String,
    pub value: f64,
}

/// VIFs for every non-intercept coefficient.
///
/// Returns `None` when the matrix is malformed or has a non-positive
/// variance. A single predictor has a VIF of 1; a non-invertible
/// correlation matrix gives infinite VIFs.
pub fn variance_inflation(covariance: &CovarianceMatrix) -> Option<Vec<Vif>> {
    if !covariance.is_well_formed() {
        return None;
    }
    let keep: Vec<usize> = covariance
        .names
        .iter()
        .enumerate()
        .filter(|(_, name)| name.as_str() != INTERCEPT)
        .map(|(i, _)| i)
        .collect();
    if keep.is_empty() {
        return Some(Vec::new());
    }

    let sd: Vec<f64> = keep
        .iter()
        .map(|&i| covariance.values[i][i].sqrt())
        .collect();
    if sd.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return None;
    }

    let p = keep.len();
    let names = || keep.iter().map(|&i| covariance.names[i].clone());
    if p == 1 {
        return Some(names().map(|name| Vif { name, value: 1.0 }).collect());
    }

    let correlation = DMatrix::from_fn(p, p, |r, c| {
        covariance.values[keep[r]][keep[c]] / (sd[r] * sd[c])
    });
    let values: Vec<f64> = match correlation.try_inverse() {
        Some(inverse) => (0..p).map(|j| inverse[(j, j)]).collect(),
        None => vec![f64::INFINITY; p],
    };
    Some(
        names()
            .zip(values)
            .map(|(name, value)| Vif { name, value })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cov(names: &[&str], values: Vec<Vec<f64>>) -> CovarianceMatrix {
        CovarianceMatrix::new(names.iter().map(|s| (*s).to_string()).collect(), values)
    }

    #[test]
    fn uncorrelated_coefficients_have_unit_vif() {
        let m = cov(
            &["(Intercept)", "a", "b"],
            vec![
                vec![1.0, 0.3, 0.2],
                vec![0.3, 4.0, 0.0],
                vec![0.2, 0.0, 9.0],
            ],
        );
        let vif = variance_inflation(&m).unwrap();
        assert_eq!(vif.len(), 2);
        assert_relative_eq!(vif[0].value, 1.0, epsilon = 1e-12);
        assert_relative_eq!(vif[1].value, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn two_predictors_follow_closed_form() {
        // VIF = 1 / (1 - r^2) with r = 0.9
        let m = cov(&["a", "b"], vec![vec![1.0, 0.9], vec![0.9, 1.0]]);
        let vif = variance_inflation(&m).unwrap();
        assert_relative_eq!(vif[0].value, 1.0 / (1.0 - 0.81), epsilon = 1e-9);
        assert_eq!(vif[1].name, "b");
    }

    #[test]
    fn perfectly_collinear_is_infinite_or_huge() {
        let m = cov(&["a", "b"], vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
        let vif = variance_inflation(&m).unwrap();
        assert!(vif[0].value.is_infinite() || vif[0].value > 1e6);
    }

    #[test]
    fn malformed_matrix_is_not_assessed() {
        let m = cov(&["a", "b"], vec![vec![1.0]]);
        assert!(variance_inflation(&m).is_none());
        let m = cov(&["a", "b"], vec![vec![0.0, 0.0], vec![0.0, 1.0]]);
        assert!(variance_inflation(&m).is_none());
    }
}
