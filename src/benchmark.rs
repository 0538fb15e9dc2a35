//! # Benchmark Engine Module
//!
//! Orchestrates one run: every combination gets a runner process and an
//! endpoint on a shared sample server, then the [`Scheduler`] measures them
//! until their budgets are spent or the run is stopped.
//!
//! ## Key Components
//!
//! - **BenchmarkConfig**: budget, precision target and calibration tunables
//! - **BenchmarkRunner**: wires the sample server, the supervisor and the
//!   scheduler together for one set of combinations
//!
//! ## Run Lifecycle
//!
//! 1. **Setup**: bind the sample server and spawn one runner per combination;
//!    a runner that cannot be spawned fails its combination only
//! 2. **Measurement**: the scheduler drives every combination, one sample at
//!    a time
//! 3. **Cleanup**: children are told to exit and reaped, the server shuts
//!    down
//!
//! ## Cancellation
//!
//! The scheduler future is raced against [`StopToken::aborted`]. When the
//! abort wins, the scheduler and every channel it owns are dropped, which
//! kills the children, and the run returns [`RunError::Aborted`] instead of
//! results.

use crate::calibration::CalibrationSettings;
use crate::cli::Args;
use crate::combination::{
    Combination, CombinationResult, CombinationState, DurationBudget, Limits, PRECISION_TARGETS,
};
use crate::error::{CombinationError, RunError};
use crate::ipc::RpcServer;
use crate::runner::RunnerRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::stop::StopToken;
use crate::supervisor::{self, ProcessChannel};
use anyhow::{bail, Result};
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for benchmark execution
///
/// This structure is the engine-side view of the command line: everything
/// that decides how long and how precisely each combination is measured.
#[derive(Clone, Debug, PartialEq)]
pub struct BenchmarkConfig {
    /// How long each combination may be measured.
    pub budget: DurationBudget,

    /// Index into [`PRECISION_TARGETS`]. A combination stops once its
    /// relative margin of error reaches the target.
    pub precision: Option<usize>,

    /// Wall duration each sample aims for once calibrated.
    pub target_sample_duration: Duration,

    /// Relative `repeat` change above which measures are discarded.
    pub renormalization_threshold: f64,

    /// Keep measuring the other combinations after a failure.
    pub keep_going: bool,

    /// Seed of the initial scheduling order.
    pub seed: Option<u64>,

    /// Time a stopped run gets to finish before it is aborted.
    pub abort_grace: Duration,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            budget: DurationBudget::Limit(crate::defaults::DURATION),
            precision: None,
            target_sample_duration: crate::defaults::TARGET_SAMPLE_DURATION,
            renormalization_threshold: crate::calibration::RENORMALIZATION_THRESHOLD,
            keep_going: false,
            seed: None,
            abort_grace: crate::defaults::ABORT_GRACE,
        }
    }
}

impl BenchmarkConfig {
    /// Create benchmark configuration from CLI arguments
    ///
    /// A precision target without an explicit duration measures until the
    /// target is reached, so the budget then defaults to unbounded.
    pub fn from_args(args: &Args) -> Result<Self> {
        if let Some(precision) = args.precision {
            if precision >= PRECISION_TARGETS.len() {
                bail!(
                    "'precision' must be between 0 and {}, not {}",
                    PRECISION_TARGETS.len() - 1,
                    precision
                );
            }
        }
        if args.sample_duration.is_zero() {
            bail!("'sample-duration' must be greater than zero");
        }

        let budget = match (args.duration, args.precision) {
            (Some(budget), _) => budget,
            (None, Some(_)) => DurationBudget::Unbounded,
            (None, None) => DurationBudget::Limit(crate::defaults::DURATION),
        };

        Ok(Self {
            budget,
            precision: args.precision,
            target_sample_duration: args.sample_duration,
            keep_going: args.keep_going,
            seed: args.seed,
            abort_grace: args.abort_grace,
            ..Self::default()
        })
    }

    /// Maximum `rmoe` a combination must reach, if any.
    pub fn precision_target(&self) -> Option<f64> {
        self.precision.and_then(|index| PRECISION_TARGETS.get(index).copied())
    }

    pub fn calibration_settings(&self) -> CalibrationSettings {
        CalibrationSettings {
            target_sample_duration: self.target_sample_duration,
            renormalization_threshold: self.renormalization_threshold,
        }
    }

    fn scheduler_config(&self, combinations: usize) -> SchedulerConfig {
        SchedulerConfig {
            limits: Limits::new(self.budget, self.precision_target(), combinations),
            calibration: self.calibration_settings(),
            keep_going: self.keep_going,
            seed: self.seed,
        }
    }
}

/// What a completed (or stopped) run returns
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkOutcome {
    /// The run ended because a stop was requested.
    pub stopped: bool,
    /// One result per combination, in input order.
    pub combinations: Vec<CombinationResult>,
}

/// Benchmark runner that measures a set of combinations
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    registry: RunnerRegistry,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig, registry: RunnerRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Measure `combinations` until their budgets are spent or `stop` says
    /// otherwise
    ///
    /// ## Returns
    /// - `Ok(BenchmarkOutcome)`: one result per combination, failed ones
    ///   included
    /// - `Err(RunError::Aborted)`: the run was aborted, nothing was kept
    /// - `Err(RunError::Server)`: the sample server could not be started
    pub async fn run(
        &self,
        combinations: Vec<Combination>,
        stop: StopToken,
    ) -> Result<BenchmarkOutcome, RunError> {
        let server = RpcServer::bind().await?;
        debug!("Sample server listening on {}", server.origin());

        let mut scheduler = Scheduler::new(
            self.config.scheduler_config(combinations.len()),
            stop.clone(),
        );
        for combination in combinations {
            let runner = match self.registry.get(&combination.runner_id) {
                Ok(runner) => runner,
                Err(e) => {
                    let error = CombinationError::user(format!("{:#}", e));
                    scheduler.add_failed(CombinationState::new(combination, false).fail(error));
                    continue;
                }
            };

            let combination = combination.with_runner_version(runner.version());
            let state = CombinationState::new(combination, runner.supports_repeat());
            let endpoint = server.register(state.id());
            match supervisor::spawn(&state.combination, runner.as_ref(), server.origin()) {
                Ok(process) => {
                    scheduler.add(state, Box::new(ProcessChannel::new(endpoint, process)))
                }
                Err(error) => scheduler.add_failed(state.fail(error)),
            }
        }

        info!(
            "Running {} combination(s) with budget {:?}",
            scheduler.len(),
            self.config.budget
        );
        let outcome = tokio::select! {
            outcome = scheduler.run() => Some(outcome),
            _ = stop.aborted() => None,
        };
        server.shutdown().await;

        let outcome = outcome.ok_or(RunError::Aborted)?;
        Ok(BenchmarkOutcome {
            stopped: outcome.stopped,
            combinations: outcome
                .states
                .into_iter()
                .map(CombinationState::into_result)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopController;
    use clap::Parser;
    use serde_json::json;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["combench", "--task", "noop=noop.sh"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_config_from_args_defaults() {
        let config = BenchmarkConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config.budget, DurationBudget::Limit(crate::defaults::DURATION));
        assert_eq!(config.precision_target(), None);
        assert_eq!(config.abort_grace, crate::defaults::ABORT_GRACE);
        assert_eq!(
            config.calibration_settings(),
            CalibrationSettings::default()
        );
        assert!(!config.keep_going);
        assert!(BenchmarkConfig::from_args(&args(&["--keep-going"])).unwrap().keep_going);
    }

    #[test]
    fn test_precision_defaults_to_unbounded() {
        let config = BenchmarkConfig::from_args(&args(&["-p", "2"])).unwrap();
        assert_eq!(config.budget, DurationBudget::Unbounded);
        assert_eq!(config.precision_target(), Some(1e-2));

        let config = BenchmarkConfig::from_args(&args(&["-p", "2", "-d", "3s"])).unwrap();
        assert_eq!(config.budget, DurationBudget::Limit(Duration::from_secs(3)));

        assert!(BenchmarkConfig::from_args(&args(&["-p", "5"])).is_err());
    }

    #[tokio::test]
    async fn test_unknown_runner_fails_its_combination() {
        let runner = BenchmarkRunner::new(BenchmarkConfig::default(), RunnerRegistry::default());
        let combination = Combination::new("noop", "noop.sh", "none", json!(null), "ghost", "default");
        let controller = StopController::new(Duration::from_secs(5));

        let outcome = runner.run(vec![combination], controller.token()).await.unwrap();
        assert!(!outcome.stopped);
        let error = outcome.combinations[0].error.as_ref().unwrap();
        assert!(error.to_string().contains("Unknown runner 'ghost'"));
        assert_eq!(outcome.combinations[0].samples, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_aborted_run_returns_no_results() {
        use crate::runner::CommandRunner;
        use std::sync::Arc;

        // `sh -c <task path>` never connects, so the run waits until aborted.
        let mut registry = RunnerRegistry::default();
        registry.register(Arc::new(CommandRunner::new("inline", "sh -c").unwrap()));
        let runner = BenchmarkRunner::new(BenchmarkConfig::default(), registry);
        let combination = Combination::new("idle", "sleep 30", "none", json!(null), "inline", "default");

        let controller = StopController::new(Duration::from_secs(5));
        let aborter = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            aborter.request_stop();
            aborter.request_stop();
        });

        let result = runner.run(vec![combination], controller.token()).await;
        assert!(matches!(result, Err(RunError::Aborted)));
    }
}
