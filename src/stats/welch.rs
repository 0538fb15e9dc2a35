//! Median-based Welch's t-test.
//!
//! Used to tell whether the difference between two combinations' medians is
//! statistically significant. Welch's variant is used because the variances
//! of two benchmarks are rarely equal.

use super::moe::t_value;
use serde::{Deserialize, Serialize};

/// The three numbers the test needs from each side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub median: f64,
    pub stdev: f64,
    pub length: usize,
}

/// Whether `a` and `b` differ significantly at the 95% level.
///
/// Degenerate inputs (a side with at most one measure, or both deviations
/// exactly zero) are reported as not significant.
pub fn welch_significant(a: &SampleSummary, b: &SampleSummary) -> bool {
    if a.length <= 1 || b.length <= 1 || (a.stdev == 0.0 && b.stdev == 0.0) {
        return false;
    }

    let error_squared_a = error_squared(a);
    let error_squared_b = error_squared(b);
    let t_stat = (a.median - b.median).abs() / (error_squared_a + error_squared_b).sqrt();
    let degrees_of_freedom = (error_squared_a + error_squared_b).powi(2)
        / (error_squared_a.powi(2) / (a.length - 1) as f64
            + error_squared_b.powi(2) / (b.length - 1) as f64);

    t_stat >= t_value(degrees_of_freedom.floor() as u64)
}

fn error_squared(summary: &SampleSummary) -> f64 {
    (summary.stdev / (summary.length as f64).sqrt()).powi(2)
}
