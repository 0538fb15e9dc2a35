//! # Combench Library
//!
//! A benchmark harness that measures tasks inside separate runner processes
//! and reports statistically meaningful results.
//!
//! ## Measurement Model
//!
//! A **combination** is one task, run with one input, by one runner, on one
//! system. Every combination gets its own child process. The orchestrator
//! talks to the children over a long-polling HTTP channel on localhost and
//! never measures two combinations at the same time: samples are interleaved
//! so every combination makes comparable progress.
//!
//! Inside the child, each sample times `maxLoops` loops of `repeat` task
//! calls. The orchestrator calibrates `repeat` per combination so a loop is
//! long enough for the clock resolution and the timing overhead not to
//! dominate, then merges the per-iteration timings into a sorted array from
//! which medians, margins of error and histograms are computed.
//!
//! ## Architecture Overview
//!
//! - `benchmark`: configuration and the entry point of a run
//! - `scheduler`: least-measured-first sample loop
//! - `combination`: per-combination state and its transitions
//! - `calibration`, `aggregate`, `stats`: the measurement math
//! - `ipc`: the sample protocol, server and client sides
//! - `supervisor`, `runner`, `worker`: child processes and what runs in them
//! - `stop`: graceful stop and abort
//! - `cli`, `logging`, `results`, `utils`: the outer layers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use combench::{BenchmarkConfig, BenchmarkRunner, Combination, RunnerRegistry, StopController};
//! use combench::combination::DurationBudget;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         budget: DurationBudget::Limit(Duration::from_secs(5)),
//!         ..BenchmarkConfig::default()
//!     };
//!     let combination = Combination::new("sort", "bench/sort.sh", "default", serde_json::Value::Null, "shell", "default");
//!
//!     let stop = StopController::new(config.abort_grace);
//!     let runner = BenchmarkRunner::new(config, RunnerRegistry::with_builtins());
//!     let outcome = runner.run(vec![combination], stop.token()).await?;
//!
//!     for result in outcome.combinations {
//!         println!("{}: {:?}", result.task_id, result.stats.map(|stats| stats.median));
//!     }
//!     Ok(())
//! }
//! ```

pub mod aggregate;

/// Core benchmarking functionality
///
/// Contains `BenchmarkRunner` and `BenchmarkConfig`, which set up the sample
/// server and the runner processes and hand them to the scheduler.
pub mod benchmark;

pub mod calibration;

/// Command-line interface and configuration
///
/// Argument parsing with clap, budget and duration parsing, and the
/// task × input × runner × system product.
pub mod cli;

pub mod combination;
pub mod error;

/// The sample protocol
///
/// Wire types shared by both sides, the axum server the orchestrator runs
/// and the blocking reqwest client runners use.
pub mod ipc;

pub mod logging;

/// Result files and comparison with a previous run
pub mod results;

pub mod runner;
pub mod scheduler;
pub mod stats;
pub mod stop;
pub mod supervisor;
pub mod utils;
pub mod worker;

pub use benchmark::{BenchmarkConfig, BenchmarkOutcome, BenchmarkRunner};
pub use cli::Args;
pub use combination::{Combination, CombinationResult};
pub use error::{CombinationError, CombinationFailure, RunError};
pub use results::{BenchmarkResults, ResultsManager};
pub use runner::{Runner, RunnerRegistry};
pub use stats::Stats;
pub use stop::{StopController, StopToken};

/// The current version of combench
///
/// Populated from Cargo.toml and recorded in every results file.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default measuring budget of each combination
    pub const DURATION: Duration = Duration::from_secs(10);

    /// Wall duration each calibrated sample aims for
    ///
    /// Long enough to amortize one HTTP round trip, short enough for stop
    /// requests and the interleaving of combinations to stay responsive.
    pub const TARGET_SAMPLE_DURATION: Duration = Duration::from_millis(100);

    /// Time a stopped run gets to finish before it is aborted
    pub const ABORT_GRACE: Duration = Duration::from_secs(5);

    /// Default output file name
    pub const OUTPUT_FILE: &str = "benchmark_results.json";

    /// Runner used when none is given
    pub const RUNNER: &str = "shell";

    /// System id used when none is given
    pub const SYSTEM: &str = "default_system";

    /// Input id used when no input is given; its value is `null`
    pub const INPUT: &str = "default";
}
