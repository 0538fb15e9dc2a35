//! # Combinations
//!
//! A combination is one unit of measurement: a task, run with one input, by
//! one runner, on one system. [`Combination`] holds what identifies it and
//! what the child process needs to load it. [`CombinationState`] holds what
//! the scheduler learns while measuring it.
//!
//! `CombinationState` is owned by the scheduler and only ever updated through
//! by-value transitions (`record_sample`, `fail`, `stop`, ...), so a state is
//! never observed half-updated.

use crate::aggregate::{measure_capacity, Aggregator};
use crate::calibration::{Adjustment, Calibration, CalibrationSettings};
use crate::error::{CombinationError, CombinationFailure};
use crate::ipc::{SampleBatch, SampleParams};
use crate::stats::{median, Counters, Stats};
use crate::utils::generate_combination_id;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Precision targets selectable with `--precision`, as maximum `rmoe`.
pub const PRECISION_TARGETS: [f64; 5] = [0.0, 5e-2, 1e-2, 5e-3, 1e-3];

/// Identity and load parameters of one combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Combination {
    /// Random identifier, unique within a run. Also the IPC endpoint path.
    pub id: String,
    pub task_id: String,
    pub task_path: PathBuf,
    pub input_id: String,
    pub input: serde_json::Value,
    pub runner_id: String,
    pub runner_config: serde_json::Value,
    /// Reported by the runner when the combination is spawned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_version: Option<String>,
    pub system_id: String,
}

impl Combination {
    pub fn new(
        task_id: impl Into<String>,
        task_path: impl Into<PathBuf>,
        input_id: impl Into<String>,
        input: serde_json::Value,
        runner_id: impl Into<String>,
        system_id: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_combination_id(),
            task_id: task_id.into(),
            task_path: task_path.into(),
            input_id: input_id.into(),
            input,
            runner_id: runner_id.into(),
            runner_config: serde_json::Value::Object(Default::default()),
            runner_version: None,
            system_id: system_id.into(),
        }
    }

    pub fn with_runner_config(mut self, runner_config: serde_json::Value) -> Self {
        self.runner_config = runner_config;
        self
    }

    pub fn with_runner_version(mut self, runner_version: Option<String>) -> Self {
        self.runner_version = runner_version;
        self
    }

    /// Tag `error` with this combination.
    pub fn failure(&self, error: CombinationError) -> CombinationFailure {
        CombinationFailure {
            combination_id: self.id.clone(),
            task_id: self.task_id.clone(),
            input_id: self.input_id.clone(),
            error,
        }
    }
}

/// How long each combination may be measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DurationBudget {
    /// Until the run is stopped, or the precision target is reached.
    Unbounded,
    /// A single sample, plus calibration samples for fast tasks.
    Once,
    /// Until the accumulated sample duration would exceed this limit.
    Limit(Duration),
}

impl DurationBudget {
    /// Budget left for a combination that has measured for `total_duration`.
    /// `None` when the budget is not a time limit.
    pub fn remaining(&self, total_duration: Duration) -> Option<Duration> {
        match self {
            Self::Limit(limit) => Some(limit.saturating_sub(total_duration)),
            Self::Unbounded | Self::Once => None,
        }
    }
}

/// Lifecycle of a combination during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// Spawned, waiting for its first sample.
    Pending,
    Calibrating,
    Measuring,
    /// No further samples will be requested.
    Stopping,
    /// The child was told to exit.
    Exited,
    Failed,
}

/// What the scheduler needs to decide whether a combination keeps going.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub budget: DurationBudget,
    pub precision_target: Option<f64>,
    pub capacity: u64,
}

impl Limits {
    pub fn new(budget: DurationBudget, precision_target: Option<f64>, combinations: usize) -> Self {
        Self {
            budget,
            precision_target,
            capacity: measure_capacity(combinations),
        }
    }
}

/// Run state of one combination, owned by the scheduler.
#[derive(Debug, Clone)]
pub struct CombinationState {
    pub combination: Combination,
    pub phase: Phase,
    pub calibration: Calibration,
    pub aggregator: Aggregator,
    pub samples: u64,
    pub loops: u64,
    pub times: u64,
    pub total_duration: Duration,
    pub error: Option<CombinationError>,
}

impl CombinationState {
    pub fn new(combination: Combination, supports_repeat: bool) -> Self {
        Self {
            combination,
            phase: Phase::Pending,
            calibration: Calibration::new(supports_repeat),
            aggregator: Aggregator::new(),
            samples: 0,
            loops: 0,
            times: 0,
            total_duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.combination.id
    }

    /// Whether the combination can still be sampled.
    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Pending | Phase::Calibrating | Phase::Measuring)
    }

    /// Whether the child process is still waiting for an instruction.
    pub fn is_live(&self) -> bool {
        self.is_active() || self.phase == Phase::Stopping
    }

    pub fn counters(&self) -> Counters {
        Counters {
            samples: self.samples,
            loops: self.loops,
            times: self.times,
            repeat: self.calibration.repeat(),
            min_loop_duration: self.calibration.min_loop_duration().unwrap_or(0.0),
        }
    }

    /// Mean wall duration of the samples so far.
    pub fn sample_duration_mean(&self) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }
        self.total_duration.div_f64(self.samples as f64)
    }

    /// Whether another sample should be requested.
    pub fn has_remaining(&self, limits: &Limits) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.samples == 0 {
            return true;
        }
        if self.aggregator.len() as u64 >= limits.capacity {
            return false;
        }
        if let Some(target) = limits.precision_target {
            let precise = self
                .aggregator
                .stats()
                .and_then(|stats| stats.rmoe)
                .is_some_and(|rmoe| rmoe <= target);
            if self.calibration.is_calibrated() && precise {
                return false;
            }
        }

        match limits.budget {
            DurationBudget::Unbounded => true,
            DurationBudget::Limit(limit) => {
                self.total_duration + self.sample_duration_mean() < limit
            }
            DurationBudget::Once => self.calibration.is_fast_and_uncalibrated(),
        }
    }

    /// Parameters of the next sample.
    pub fn next_params(&self, limits: &Limits, settings: &CalibrationSettings) -> SampleParams {
        let capacity = limits.capacity.saturating_sub(self.aggregator.len() as u64);
        SampleParams {
            repeat: self.calibration.repeat(),
            max_loops: self.calibration.max_loops(
                settings,
                limits.budget.remaining(self.total_duration),
                capacity,
            ),
            empty: self.calibration.wants_empty(),
        }
    }

    /// Longest a sample exchange may take before it is a timeout.
    pub fn sample_timeout(&self, limits: &Limits, settings: &CalibrationSettings) -> Option<Duration> {
        limits
            .budget
            .remaining(self.total_duration)
            .map(|remaining| remaining + settings.target_sample_duration)
    }

    /// Fold one sample, measured with `params` in `elapsed` wall time.
    pub fn record_sample(
        mut self,
        params: &SampleParams,
        batch: SampleBatch,
        elapsed: Duration,
        settings: &CalibrationSettings,
    ) -> Self {
        let SampleBatch {
            main_measures,
            mut empty_measures,
        } = batch;

        self.samples += 1;
        self.loops += main_measures.len() as u64;
        self.times += main_measures.len() as u64 * params.repeat;
        self.total_duration += elapsed;

        if params.empty && !empty_measures.is_empty() {
            empty_measures.sort_unstable_by(f64::total_cmp);
            self.calibration.observe_empty(&empty_measures);
        }

        let mut per_iteration: Vec<f64> = main_measures
            .iter()
            .map(|measure| measure / params.repeat.max(1) as f64)
            .collect();
        per_iteration.sort_unstable_by(f64::total_cmp);
        let adjustment = if per_iteration.is_empty() {
            Adjustment::default()
        } else {
            self.calibration.adjust(median(&per_iteration), settings)
        };

        if adjustment.reset {
            debug!(
                "Task '{}' renormalized to repeat {}, dropping {} measures",
                self.combination.task_id,
                self.calibration.repeat(),
                self.aggregator.len()
            );
            self.aggregator.clear();
        } else {
            self.aggregator.push(&main_measures, params.repeat);
        }

        self.calibration
            .record_wall_duration(elapsed, main_measures.len(), params.repeat);
        self.aggregator.tick(elapsed);
        if self
            .aggregator
            .should_aggregate(self.calibration.is_calibrated(), adjustment.just_calibrated)
        {
            let counters = self.counters();
            self.aggregator.aggregate(counters);
        }

        self.phase = if self.calibration.is_calibrated() {
            Phase::Measuring
        } else {
            Phase::Calibrating
        };
        self
    }

    /// Mark the combination failed. No further samples are requested.
    pub fn fail(mut self, error: CombinationError) -> Self {
        self.phase = Phase::Failed;
        self.error = Some(error);
        self
    }

    /// Stop requesting samples; the child still has to be told to exit.
    pub fn stop(mut self) -> Self {
        if self.is_active() {
            self.phase = Phase::Stopping;
        }
        self
    }

    /// The child was sent its exit instruction.
    pub fn exit(mut self) -> Self {
        if self.phase != Phase::Failed {
            self.phase = Phase::Exited;
        }
        self
    }

    /// Merge whatever is still buffered and compute final statistics.
    pub fn finalize(mut self) -> Self {
        let counters = self.counters();
        self.aggregator.aggregate(counters);
        self
    }

    pub fn into_result(self) -> CombinationResult {
        let failure = self
            .error
            .clone()
            .map(|error| self.combination.failure(error));
        CombinationResult {
            id: self.combination.id,
            task_id: self.combination.task_id,
            input_id: self.combination.input_id,
            runner_id: self.combination.runner_id,
            runner_version: self.combination.runner_version,
            system_id: self.combination.system_id,
            stats: self.aggregator.stats().cloned(),
            error: failure,
            samples: self.samples,
            loops: self.loops,
            times: self.times,
            processes: 1,
        }
    }
}

/// What the engine returns for one combination at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinationResult {
    pub id: String,
    pub task_id: String,
    pub input_id: String,
    pub runner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_version: Option<String>,
    pub system_id: String,
    pub stats: Option<Stats>,
    pub error: Option<CombinationFailure>,
    pub samples: u64,
    pub loops: u64,
    pub times: u64,
    pub processes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(supports_repeat: bool) -> CombinationState {
        let combination = Combination::new("task", "task.sh", "input", json!(null), "shell", "default");
        CombinationState::new(combination, supports_repeat)
    }

    fn batch(main_measures: Vec<f64>) -> SampleBatch {
        SampleBatch {
            main_measures,
            empty_measures: Vec::new(),
        }
    }

    fn limits(budget: DurationBudget) -> Limits {
        Limits::new(budget, None, 1)
    }

    #[test]
    fn test_sample_duration_mean_beyond_u32_samples() {
        let mut state = state(false);
        assert_eq!(state.sample_duration_mean(), Duration::ZERO);

        state.samples = (1 << 32) + 2;
        state.total_duration = Duration::from_secs(1 << 32);
        let mean = state.sample_duration_mean();
        assert!(mean < Duration::from_secs(1));
        assert!(mean > Duration::from_millis(999));
    }

    #[test]
    fn test_record_sample_updates_counters() {
        let settings = CalibrationSettings::default();
        let state = state(false);
        let params = state.next_params(&limits(DurationBudget::Unbounded), &settings);
        assert_eq!(params.max_loops, 1);
        assert!(!params.empty);

        let state = state.record_sample(&params, batch(vec![1000.0]), Duration::from_millis(2), &settings);
        assert_eq!(state.samples, 1);
        assert_eq!(state.loops, 1);
        assert_eq!(state.times, 1);
        assert_eq!(state.phase, Phase::Measuring);
        assert_eq!(state.aggregator.stats().unwrap().median, 1000.0);

        let params = state.next_params(&limits(DurationBudget::Unbounded), &settings);
        assert_eq!(params.max_loops, 50);
    }

    #[test]
    fn test_once_budget_runs_one_sample_without_repeat() {
        let settings = CalibrationSettings::default();
        let limits = limits(DurationBudget::Once);
        let state = state(false);
        assert!(state.has_remaining(&limits));

        let params = state.next_params(&limits, &settings);
        let state = state.record_sample(&params, batch(vec![5.0]), Duration::from_millis(1), &settings);
        assert!(!state.has_remaining(&limits));
    }

    #[test]
    fn test_limit_budget() {
        let settings = CalibrationSettings::default();
        let limits = limits(DurationBudget::Limit(Duration::from_millis(350)));
        let mut state = state(false);
        let mut samples = 0;
        while state.has_remaining(&limits) {
            let params = state.next_params(&limits, &settings);
            state = state.record_sample(&params, batch(vec![1.0]), Duration::from_millis(100), &settings);
            samples += 1;
        }
        assert_eq!(samples, 3);
        assert_eq!(
            state.sample_timeout(&limits, &settings),
            Some(Duration::from_millis(150))
        );
    }

    #[test]
    fn test_precision_target_stops() {
        let settings = CalibrationSettings::default();
        let limits = Limits::new(DurationBudget::Unbounded, Some(PRECISION_TARGETS[1]), 1);
        let state = state(false);
        let params = state.next_params(&limits, &settings);
        let measures: Vec<f64> = (0..100).map(|index| 1000.0 + (index % 5) as f64).collect();
        let state = state.record_sample(&params, batch(measures), Duration::from_millis(1), &settings);
        assert!(!state.has_remaining(&limits));
    }

    #[test]
    fn test_failed_state_has_no_remaining() {
        let state = state(true).fail(CombinationError::user("boom"));
        assert_eq!(state.phase, Phase::Failed);
        assert!(!state.has_remaining(&limits(DurationBudget::Unbounded)));

        let state = state.stop().exit();
        assert_eq!(state.phase, Phase::Failed);
        let result = state.into_result();
        assert_eq!(
            result.error.unwrap().to_string(),
            "In task 'task' (input 'input'): boom"
        );
    }

    #[test]
    fn test_reset_discards_measures() {
        let settings = CalibrationSettings::default();
        let limits = limits(DurationBudget::Unbounded);
        let state = state(true);
        let params = state.next_params(&limits, &settings);
        assert!(params.empty);

        let sample = SampleBatch {
            main_measures: vec![50.0; 10],
            empty_measures: vec![20.0, 21.0, 20.0],
        };
        let state = state.record_sample(&params, sample, Duration::from_millis(1), &settings);
        assert_eq!(state.calibration.repeat(), 40);
        assert_eq!(state.phase, Phase::Calibrating);
        assert!(state.aggregator.is_empty());
        assert_eq!(state.samples, 1);
    }
}
