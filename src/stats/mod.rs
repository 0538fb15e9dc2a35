//! # Statistics Engine
//!
//! Pure functions over sorted arrays of per-iteration durations, expressed in
//! nanoseconds as `f64`. Nothing here holds state or performs I/O; the
//! aggregator calls [`Stats::compute`] whenever it decides a fresh snapshot
//! is worth the cost.
//!
//! ## Outlier Trimming
//!
//! The lowest and highest 5% of measures are excluded from the mean, the
//! deviation, the quantiles and the histogram. The trim bounds are found by
//! index (`round((n - 1) * p)`) so the array is never copied. `min` and `max`
//! keep the untrimmed extremes and the median is taken over the whole array,
//! which the symmetric trim would not move anyway.
//!
//! ## Precision
//!
//! `stdev`, `moe` and `rmoe` need at least [`MIN_STDEV_LENGTH`] trimmed
//! measures to be meaningful and are `None` below that.

mod histogram;
mod merge;
mod moe;
mod quantile;
mod welch;

pub use histogram::{histogram, Bucket};
pub use merge::{merge_sorted, sort_batch};
pub use moe::{margin_of_error, t_value};
pub use quantile::{median, quantile, quantiles, rounded_position};
pub use welch::{welch_significant, SampleSummary};

use serde::{Deserialize, Serialize};

/// Lower trim bound, as a fraction of the sorted measures.
pub const OUTLIERS_LOW: f64 = 0.05;

/// Upper trim bound, as a fraction of the sorted measures.
pub const OUTLIERS_HIGH: f64 = 0.95;

/// Number of histogram buckets in a snapshot.
pub const HISTOGRAM_BUCKETS: usize = 100;

/// Number of quantile intervals in a snapshot (101 values, 0% to 100%).
pub const QUANTILE_COUNT: usize = 100;

/// Below this trimmed length the deviation is withheld.
pub const MIN_STDEV_LENGTH: usize = 5;

/// Counters copied into a snapshot from the combination that owns it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    /// Number of samples received.
    pub samples: u64,
    /// Number of timed loops, each running `repeat` iterations.
    pub loops: u64,
    /// Number of individual task calls.
    pub times: u64,
    /// Iterations per loop at the time of the snapshot.
    pub repeat: u64,
    /// Minimum loop duration in nanoseconds, `0.0` when not applicable.
    pub min_loop_duration: f64,
}

/// Immutable statistical summary of a combination's measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub median: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Value at the lower trim bound.
    pub low: f64,
    /// Value at the upper trim bound.
    pub high: f64,
    pub stdev: Option<f64>,
    /// Margin of error of the median at 95% confidence.
    pub moe: Option<f64>,
    /// `moe / median`.
    pub rmoe: Option<f64>,
    /// Number of measures between the trim bounds.
    pub length: usize,
    pub quantiles: Vec<f64>,
    pub histogram: Vec<Bucket>,
    #[serde(flatten)]
    pub counters: Counters,
}

impl Stats {
    /// Compute a snapshot from sorted `measures`.
    ///
    /// Returns `None` for an empty array.
    pub fn compute(measures: &[f64], counters: Counters) -> Option<Self> {
        if measures.is_empty() {
            return None;
        }

        let low_index = rounded_position(measures, OUTLIERS_LOW);
        let high_index = rounded_position(measures, OUTLIERS_HIGH);
        let trimmed = &measures[low_index..=high_index];
        let length = trimmed.len();

        let median = median(measures);
        let mean = trimmed.iter().sum::<f64>() / length as f64;

        let stdev = (length >= MIN_STDEV_LENGTH).then(|| {
            let variance = trimmed
                .iter()
                .map(|value| (value - mean).powi(2))
                .sum::<f64>()
                / (length - 1) as f64;
            variance.sqrt()
        });
        let moe = stdev.map(|stdev| margin_of_error(stdev, length));
        let rmoe = moe.and_then(|moe| (median != 0.0).then(|| moe / median));

        Some(Self {
            median,
            mean,
            min: measures[0],
            max: measures[measures.len() - 1],
            low: measures[low_index],
            high: measures[high_index],
            stdev,
            moe,
            rmoe,
            length,
            quantiles: quantiles(trimmed, QUANTILE_COUNT),
            histogram: histogram(measures, low_index, high_index, HISTOGRAM_BUCKETS),
            counters,
        })
    }

    /// The triple the significance test needs, when a deviation is known.
    pub fn summary(&self) -> Option<SampleSummary> {
        self.stdev.map(|stdev| SampleSummary {
            median: self.median,
            stdev,
            length: self.length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_empty() {
        assert!(Stats::compute(&[], Counters::default()).is_none());
    }

    #[test]
    fn test_compute_trims_outliers() {
        let mut measures: Vec<f64> = (1..=99).map(f64::from).collect();
        measures.insert(0, -1000.0);
        measures.push(1_000_000.0);
        let stats = Stats::compute(&measures, Counters::default()).unwrap();

        assert_eq!(stats.min, -1000.0);
        assert_eq!(stats.max, 1_000_000.0);
        assert_eq!(stats.low, 5.0);
        assert_eq!(stats.high, 95.0);
        assert_eq!(stats.median, 50.0);
        assert!((stats.mean - 50.0).abs() < 1e-9);
        assert_eq!(stats.length, 91);
        assert_eq!(stats.quantiles.len(), QUANTILE_COUNT + 1);
        assert_eq!(stats.quantiles[0], 5.0);
        assert_eq!(stats.quantiles[QUANTILE_COUNT], 95.0);
        assert_eq!(stats.histogram.len(), HISTOGRAM_BUCKETS);
        let total: f64 = stats.histogram.iter().map(|bucket| bucket.frequency).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_withholds_stdev_for_short_arrays() {
        let stats = Stats::compute(&[1.0, 2.0, 3.0], Counters::default()).unwrap();
        assert!(stats.stdev.is_none());
        assert!(stats.moe.is_none());
        assert!(stats.rmoe.is_none());
        assert!(stats.summary().is_none());
        assert_eq!(stats.median, 2.0);
    }

    #[test]
    fn test_compute_precision() {
        let measures: Vec<f64> = (0..1000).map(|index| 100.0 + (index % 10) as f64).collect();
        let mut measures = measures;
        sort_batch(&mut measures);
        let stats = Stats::compute(&measures, Counters::default()).unwrap();

        let stdev = stats.stdev.unwrap();
        assert!(stdev > 2.0 && stdev < 3.5);
        let moe = stats.moe.unwrap();
        assert!((moe - margin_of_error(stdev, stats.length)).abs() < 1e-12);
        assert!((stats.rmoe.unwrap() - moe / stats.median).abs() < 1e-12);
    }

    #[test]
    fn test_compute_zero_median_has_no_rmoe() {
        let stats = Stats::compute(&[0.0; 20], Counters::default()).unwrap();
        assert_eq!(stats.stdev, Some(0.0));
        assert!(stats.rmoe.is_none());
    }

    #[test]
    fn test_counters_are_carried() {
        let counters = Counters {
            samples: 3,
            loops: 30,
            times: 300,
            repeat: 10,
            min_loop_duration: 5000.0,
        };
        let stats = Stats::compute(&[1.0], counters).unwrap();
        assert_eq!(stats.counters, counters);
    }
}
