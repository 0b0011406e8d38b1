use crate::model::TimingSummary;
use std::time::Duration;

/// Compute (mean, median, 25th percentile, 75th percentile) from samples
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let mean = samples.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

/// Generation-time statistics over saved outputs. `None` when nothing was generated.
pub fn timing_summary(elapsed: &[Duration], fallbacks: usize) -> Option<TimingSummary> {
    let secs: Vec<f64> = elapsed.iter().map(Duration::as_secs_f64).collect();
    let (mean_secs, median_secs, p25_secs, p75_secs) = compute_metrics(&secs)?;
    Some(TimingSummary {
        samples: secs.len(),
        mean_secs,
        median_secs,
        p25_secs,
        p75_secs,
        fallbacks,
    })
}
