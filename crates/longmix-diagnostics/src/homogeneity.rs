//! Brown–Forsythe (median-centred Levene) test of equal residual variance
//! across groups.

use statrs::distribution::{ContinuousCDF, FisherSnedecor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrownForsythe {
    pub statistic: f64,
    pub p_value: f64,
    pub df_between: f64,
    pub df_within: f64,
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Runs the test over residual groups.
///
/// Returns `None` when fewer than two groups have at least two values, or
/// when every absolute deviation is zero.
pub fn brown_forsythe(groups: &[Vec<f64>]) -> Option<BrownForsythe> {
    let deviations: Vec<Vec<f64>> = groups
        .iter()
        .filter(|g| g.len() >= 2)
        .map(|g| {
            let mut sorted = g.clone();
            let m = median(&mut sorted);
            g.iter().map(|x| (x - m).abs()).collect()
        })
        .collect();

    let k = deviations.len();
    let n: usize = deviations.iter().map(Vec::len).sum();
    if k < 2 || n <= k {
        return None;
    }

    let grand_mean = deviations.iter().flatten().sum::<f64>() / n as f64;
    let mut between = 0.0;
    let mut within = 0.0;
    for z in &deviations {
        let group_mean = z.iter().sum::<f64>() / z.len() as f64;
        between += z.len() as f64 * (group_mean - grand_mean).powi(2);
        within += z.iter().map(|v| (v - group_mean).powi(2)).sum::<f64>();
    }
    if within <= 0.0 {
        return None;
    }

    let df_between = (k - 1) as f64;
    let df_within = (n - k) as f64;
    let statistic = (between / df_between) / (within / df_within);
    let dist = FisherSnedecor::new(df_between, df_within).ok()?;
    Some(BrownForsythe {
        statistic,
        p_value: dist.sf(statistic),
        df_between,
        df_within,
    })
}
