//! # Calibration Controller
//!
//! Decides, per combination, how many task iterations each timed loop runs
//! (`repeat`) and how many loops each sample runs (`maxLoops`).
//!
//! ## Minimum Loop Duration
//!
//! Taking two timestamps has a cost of its own. Runners that support repeat
//! loops also measure an *empty* loop (timestamps only, one iteration per
//! pair) during uncalibrated samples. From those measures:
//!
//! - `measure_cost` is the median of every empty batch median seen so far;
//! - `resolution` is the smallest positive gap between two empty measures,
//!   an estimate of the clock granularity.
//!
//! A timed loop must last at least
//! `min_loop_duration = max(measure_cost, resolution) * 100` so that neither
//! dominates the measure.
//!
//! ## Repeat
//!
//! After each sample, `repeat` moves to the smallest value whose loop lasts
//! `min_loop_duration`. Changes of at least the renormalization threshold
//! invalidate the measures accumulated so far.

use crate::stats::median;
use std::time::Duration;

/// How many times slower a loop must be than the cost of a measure.
pub const MIN_MEASURE_COST: f64 = 1e2;

/// How many times slower a loop must be than the clock resolution.
pub const MIN_RESOLUTION_PRECISION: f64 = 1e2;

/// Default relative `repeat` change that resets accumulated measures.
pub const RENORMALIZATION_THRESHOLD: f64 = 0.1;

/// A task is "fast" while its median is below this multiple of the minimum
/// loop duration. Fast tasks keep calibrating under a run-once budget.
pub const FAST_TASK_FACTOR: f64 = 1e2;

/// Upper bound on `repeat`, reached only with a degenerate clock.
pub const MAX_REPEAT: u64 = 1_000_000_000;

/// Tunables of the calibration heuristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSettings {
    /// Wall duration each sample aims for.
    pub target_sample_duration: Duration,
    /// Relative `repeat` change that resets accumulated measures.
    pub renormalization_threshold: f64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            target_sample_duration: crate::defaults::TARGET_SAMPLE_DURATION,
            renormalization_threshold: RENORMALIZATION_THRESHOLD,
        }
    }
}

/// Wall-clock shape of the previous sample, used to size the next one.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LastSample {
    wall_duration_per_loop: f64,
    repeat: u64,
}

/// What [`Calibration::adjust`] decided about the sample just received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Adjustment {
    /// `repeat` changed enough that earlier measures must be discarded.
    pub reset: bool,
    /// The combination became calibrated with this sample.
    pub just_calibrated: bool,
}

/// Per-combination calibration state.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    supports_repeat: bool,
    repeat: u64,
    min_loop_duration: Option<f64>,
    empty_medians: Vec<f64>,
    resolution: Option<f64>,
    calibrated: bool,
    last_median: Option<f64>,
    last_sample: Option<LastSample>,
}

impl Calibration {
    pub fn new(supports_repeat: bool) -> Self {
        Self {
            supports_repeat,
            repeat: 1,
            min_loop_duration: (!supports_repeat).then_some(0.0),
            empty_medians: Vec::new(),
            resolution: None,
            calibrated: false,
            last_median: None,
            last_sample: None,
        }
    }

    pub fn repeat(&self) -> u64 {
        self.repeat
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Minimum loop duration in nanoseconds, once known.
    pub fn min_loop_duration(&self) -> Option<f64> {
        self.min_loop_duration
    }

    /// Median of every empty batch median received so far.
    pub fn measure_cost(&self) -> Option<f64> {
        (!self.empty_medians.is_empty()).then(|| median(&self.empty_medians))
    }

    pub fn resolution(&self) -> Option<f64> {
        self.resolution
    }

    /// Per-iteration median of the last sample.
    pub fn last_median(&self) -> Option<f64> {
        self.last_median
    }

    /// Whether the next sample should also measure the empty loop.
    pub fn wants_empty(&self) -> bool {
        self.supports_repeat && (!self.calibrated || self.empty_medians.is_empty())
    }

    /// Fold a sorted batch of empty-loop measures into the minimum loop
    /// duration.
    pub fn observe_empty(&mut self, empty_measures: &[f64]) {
        if !self.supports_repeat || empty_measures.is_empty() {
            return;
        }

        let batch_median = median(empty_measures);
        let position = self.empty_medians.partition_point(|value| *value < batch_median);
        self.empty_medians.insert(position, batch_median);

        let batch_resolution = empty_measures
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|gap| *gap > 0.0)
            .fold(f64::INFINITY, f64::min);
        if batch_resolution.is_finite() {
            self.resolution = Some(match self.resolution {
                Some(resolution) => resolution.min(batch_resolution),
                None => batch_resolution,
            });
        }

        let measure_cost = median(&self.empty_medians);
        let resolution = self.resolution.unwrap_or(0.0);
        self.min_loop_duration =
            Some((measure_cost * MIN_MEASURE_COST).max(resolution * MIN_RESOLUTION_PRECISION));
    }

    /// Update `repeat` after a sample whose per-iteration median was
    /// `median_per_iteration` nanoseconds, measured with the current `repeat`.
    pub fn adjust(&mut self, median_per_iteration: f64, settings: &CalibrationSettings) -> Adjustment {
        self.last_median = Some(median_per_iteration);
        let was_calibrated = self.calibrated;

        if !self.supports_repeat {
            self.calibrated = true;
            return Adjustment {
                reset: false,
                just_calibrated: !was_calibrated,
            };
        }

        let Some(min_loop_duration) = self.min_loop_duration else {
            self.calibrated = false;
            return Adjustment {
                reset: false,
                just_calibrated: false,
            };
        };

        let loop_median = median_per_iteration * self.repeat as f64;
        let target = if median_per_iteration > 0.0 {
            ((min_loop_duration / median_per_iteration).ceil() as u64).max(1)
        } else {
            self.repeat.saturating_mul(10)
        }
        .min(MAX_REPEAT);

        let old_repeat = self.repeat;
        let lower_limit = old_repeat as f64 * (1.0 - settings.renormalization_threshold);
        if loop_median < min_loop_duration {
            self.repeat = target.max(old_repeat);
        } else if (target as f64) <= lower_limit {
            self.repeat = target;
        }

        let change = (self.repeat as f64 - old_repeat as f64).abs() / old_repeat as f64;
        let reset = change >= settings.renormalization_threshold;
        self.calibrated = loop_median >= min_loop_duration && !reset;

        Adjustment {
            reset,
            just_calibrated: self.calibrated && !was_calibrated,
        }
    }

    /// Remember the wall duration of the sample that just completed.
    pub fn record_wall_duration(&mut self, wall_duration: Duration, loops: usize, repeat: u64) {
        if loops == 0 {
            return;
        }
        self.last_sample = Some(LastSample {
            wall_duration_per_loop: wall_duration.as_nanos() as f64 / loops as f64,
            repeat,
        });
    }

    /// Number of loops the next sample should run.
    ///
    /// The first sample runs a single loop. Later samples aim for the target
    /// sample duration, scaled by how much `repeat` changed since the last
    /// sample, and never exceed `remaining` (when the budget is finite) nor
    /// `capacity` measures.
    pub fn max_loops(
        &self,
        settings: &CalibrationSettings,
        remaining: Option<Duration>,
        capacity: u64,
    ) -> u64 {
        let Some(last) = self.last_sample else {
            return 1;
        };

        let repeat_growth = self.repeat as f64 / last.repeat as f64;
        let per_loop = last.wall_duration_per_loop * repeat_growth;
        let loops_within = |duration: Duration| -> u64 {
            if per_loop <= 0.0 {
                return u64::MAX;
            }
            (duration.as_nanos() as f64 / per_loop).ceil() as u64
        };

        let mut max_loops = loops_within(settings.target_sample_duration);
        if let Some(remaining) = remaining {
            max_loops = max_loops.min(loops_within(remaining));
        }
        max_loops.min(capacity).max(1)
    }

    /// Whether a task is still fast and uncalibrated, which lets a run-once
    /// budget take further calibration samples.
    pub fn is_fast_and_uncalibrated(&self) -> bool {
        match (self.last_median, self.min_loop_duration) {
            (Some(last_median), Some(min_loop_duration)) => {
                !self.calibrated && last_median < min_loop_duration * FAST_TASK_FACTOR
            }
            _ => !self.calibrated,
        }
    }
}
