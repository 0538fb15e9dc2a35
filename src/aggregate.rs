//! # Sample Aggregator
//!
//! Incoming batches are normalized per iteration, sorted and buffered. The
//! buffers are merged into the combination's sorted `measures` and the
//! statistics recomputed only when it is worth the CPU time:
//!
//! - while the combination is uncalibrated, or just became calibrated;
//! - while no statistics exist yet;
//! - once the aggregation countdown is exhausted.
//!
//! After each aggregation the countdown is set to ten times what the
//! aggregation cost, and every sample's duration is subtracted from it, so
//! roughly 10% of the measuring time goes to aggregation.

use crate::stats::{merge_sorted, sort_batch, Counters, Stats};
use std::time::{Duration, Instant};
use tracing::trace;

/// Share of measuring time spent aggregating.
pub const AGGREGATE_RATIO: f64 = 0.1;

/// Hard cap on the number of measures held across every combination.
pub const MAX_MEASURES: u64 = 100_000_000;

/// Per-combination measure capacity when `combinations` share the cap.
pub fn measure_capacity(combinations: usize) -> u64 {
    MAX_MEASURES / combinations.max(1) as u64
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregator {
    measures: Vec<f64>,
    buffered: Vec<Vec<f64>>,
    buffered_len: usize,
    stats: Option<Stats>,
    countdown: Duration,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorted measures merged so far.
    pub fn measures(&self) -> &[f64] {
        &self.measures
    }

    pub fn stats(&self) -> Option<&Stats> {
        self.stats.as_ref()
    }

    /// Number of measures held, merged or not.
    pub fn len(&self) -> usize {
        self.measures.len() + self.buffered_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer the raw loop durations of one sample measured with `repeat`.
    pub fn push(&mut self, main_measures: &[f64], repeat: u64) {
        let repeat = repeat.max(1) as f64;
        let mut batch: Vec<f64> = main_measures.iter().map(|measure| measure / repeat).collect();
        sort_batch(&mut batch);
        self.buffered_len += batch.len();
        self.buffered.push(batch);
    }

    /// Drop every measure, merged or buffered. The previous statistics are
    /// kept until the next aggregation replaces them.
    pub fn clear(&mut self) {
        self.measures.clear();
        self.buffered.clear();
        self.buffered_len = 0;
    }

    /// Account for a sample that took `sample_duration`.
    pub fn tick(&mut self, sample_duration: Duration) {
        self.countdown = self.countdown.saturating_sub(sample_duration);
    }

    /// Whether the buffered measures should be aggregated now.
    pub fn should_aggregate(&self, calibrated: bool, just_calibrated: bool) -> bool {
        !calibrated || just_calibrated || self.stats.is_none() || self.countdown.is_zero()
    }

    /// Merge buffered measures and recompute the statistics.
    pub fn aggregate(&mut self, counters: Counters) {
        let started = Instant::now();
        for batch in self.buffered.drain(..) {
            merge_sorted(&mut self.measures, &batch);
        }
        self.buffered_len = 0;
        if let Some(stats) = Stats::compute(&self.measures, counters) {
            self.stats = Some(stats);
        }
        self.record_cost(started.elapsed());
    }

    fn record_cost(&mut self, cost: Duration) {
        self.countdown = cost.div_f64(AGGREGATE_RATIO);
        trace!(
            "Aggregated {} measures in {:?}, next in {:?}",
            self.measures.len(),
            cost,
            self.countdown
        );
    }
}
