//! Jarque–Bera test of residual normality.

use statrs::distribution::{ChiSquared, ContinuousCDF};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JarqueBera {
    pub statistic: f64,
    pub p_value: f64,
    pub skewness: f64,
    /// Excess kurtosis (0 for a normal distribution).
    pub kurtosis: f64,
    pub n: usize,
}

/// Computes `JB = n/6 * (S² + K²/4)` with a χ²(2) p-value.
///
/// Non-finite values are ignored. Returns `None` with fewer than three
/// usable values or zero variance.
pub fn jarque_bera(residuals: &[f64]) -> Option<JarqueBera> {
    let clean: Vec<f64> = residuals.iter().copied().filter(|x| x.is_finite()).collect();
    let n = clean.len();
    if n < 3 {
        return None;
    }

    let nf = n as f64;
    let mean = clean.iter().sum::<f64>() / nf;
    let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
    for &x in &clean {
        let d = x - mean;
        let d2 = d * d;
        m2 += d2;
        m3 += d2 * d;
        m4 += d2 * d2;
    }
    m2 /= nf;
    m3 /= nf;
    m4 /= nf;
    if m2 <= f64::EPSILON * mean.abs().max(1.0) {
        return None;
    }

    let skewness = m3 / m2.powf(1.5);
    let kurtosis = m4 / (m2 * m2) - 3.0;
    let statistic = nf / 6.0 * (skewness * skewness + kurtosis * kurtosis / 4.0);
    let chi2 = ChiSquared::new(2.0).ok()?;
    let p_value = chi2.sf(statistic);

    Some(JarqueBera {
        statistic,
        p_value,
        skewness,
        kurtosis,
        n,
    })
}
