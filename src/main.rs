//! # Combench - Main Entry Point
//!
//! The binary has two modes:
//!
//! 1. **Orchestrator** (default): parse the command line, measure every
//!    combination, log a summary and write the results file.
//! 2. **Built-in runner** (`--internal-run-as-runner <id>`): the orchestrator
//!    re-executes this binary once per combination; the process loads one
//!    task and serves samples until told to exit. This mode is synchronous,
//!    so it runs before any Tokio runtime is created.
//!
//! ## Exit Status
//!
//! The orchestrator exits non-zero when the run is aborted, cannot start, or
//! any combination failed. A runner exits 1 when its task failed.

use anyhow::{bail, Result};
use clap::Parser;
use combench::{
    benchmark::{BenchmarkConfig, BenchmarkRunner},
    cli::{self, Args},
    logging,
    results::{self, BenchmarkResults, ResultsManager},
    stop::{self, StopController},
    worker,
};
use tracing::{error, info};

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(runner_id) = args.runner_mode() {
        logging::init_runner_logging();
        let code = match worker::run_builtin_runner(runner_id, &args.runner_args) {
            Ok(exit) => exit.code(),
            Err(e) => {
                error!("Runner '{}' failed: {:#}", runner_id, e);
                2
            }
        };
        std::process::exit(code);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    // Flushes the log file when dropped.
    let _log_guard = logging::init_logging(args.verbose, args.log_file.as_deref())?;
    info!("Starting combench {}", combench::VERSION);

    let config = BenchmarkConfig::from_args(&args)?;
    let registry = cli::build_registry(&args)?;
    let combinations = cli::build_combinations(&args, &registry)?;

    // Load the previous results first so a bad file fails before measuring.
    let previous = args
        .compare
        .as_deref()
        .map(ResultsManager::load)
        .transpose()?;

    let stop = StopController::new(config.abort_grace);
    let signals = stop::listen_for_signals(stop.clone());

    let runner = BenchmarkRunner::new(config.clone(), registry);
    let outcome = runner.run(combinations, stop.token()).await;
    stop.finish();
    signals.abort();
    let outcome = outcome?;

    let mut results = BenchmarkResults::new(outcome, config.budget, config.precision_target());
    if let Some(previous) = &previous {
        results::compare_with_previous(&mut results, previous);
    }
    results::log_summary(&results);
    ResultsManager::new(&args.output_file).write(&results)?;

    let failures = results.failure_count();
    if failures > 0 {
        bail!("{} combination(s) failed", failures);
    }
    info!("Benchmark completed successfully");
    Ok(())
}
