use crate::combination::{Combination, DurationBudget};
use crate::runner::{CommandRunner, RunnerRegistry};
use anyhow::{bail, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Combench - statistically rigorous benchmarks of tasks run in separate processes
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Task to measure, as ID=PATH (repeatable)
    #[clap(short = 't', long = "task", value_parser = parse_task, help_heading = "Core Options")]
    pub tasks: Vec<(String, PathBuf)>,

    /// Input passed to every task, as ID=VALUE where VALUE is JSON or a plain string (repeatable)
    #[clap(short = 'i', long = "input", value_parser = parse_input, help_heading = "Core Options")]
    pub inputs: Vec<(String, serde_json::Value)>,

    /// Runner measuring the tasks (repeatable)
    #[clap(short = 'r', long = "runner", default_values_t = vec![crate::defaults::RUNNER.to_string()], help_heading = "Core Options")]
    pub runners: Vec<String>,

    /// Register an external runner, as ID=COMMAND (repeatable)
    #[clap(long = "runner-command", value_parser = parse_runner_command)]
    pub runner_commands: Vec<(String, String)>,

    /// System identifier recorded with the results (repeatable)
    #[clap(long = "system", default_values_t = vec![crate::defaults::SYSTEM.to_string()])]
    pub systems: Vec<String>,

    /// Measuring budget per combination: 0 (until stopped), 1 (a single sample), or a duration such as 10s
    #[clap(short = 'd', long, value_parser = parse_budget, help_heading = "Measurement")]
    pub duration: Option<DurationBudget>,

    /// Stop each combination once its margin of error reaches 0 (0%), 1 (5%), 2 (1%), 3 (0.5%) or 4 (0.1%)
    #[clap(short = 'p', long, help_heading = "Measurement")]
    pub precision: Option<usize>,

    /// Wall duration each sample aims for
    #[clap(long, value_parser = parse_duration, default_value = "100ms", help_heading = "Measurement")]
    pub sample_duration: Duration,

    /// Seed of the initial scheduling order
    #[clap(long, help_heading = "Measurement")]
    pub seed: Option<u64>,

    /// Keep measuring the other combinations after one fails
    #[clap(long, default_value_t = false)]
    pub keep_going: bool,

    /// Time a stopped run gets to finish before it is aborted
    #[clap(long, value_parser = parse_duration, default_value = "5s")]
    pub abort_grace: Duration,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE)]
    pub output_file: PathBuf,

    /// Previous results file to compare against
    #[clap(long)]
    pub compare: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,

    /// Also write logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    #[clap(long = "internal-run-as-runner", hide = true)]
    pub internal_run_as_runner: Option<String>,

    /// Arguments of runner mode: <task path> <JSON params>
    #[clap(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub runner_args: Vec<String>,
}

impl Args {
    /// The built-in runner to act as, when re-executed as one.
    pub fn runner_mode(&self) -> Option<&str> {
        self.internal_run_as_runner.as_deref()
    }
}

/// The built-in runners plus every `--runner-command`.
pub fn build_registry(args: &Args) -> Result<RunnerRegistry> {
    let mut registry = RunnerRegistry::with_builtins();
    for (id, command) in &args.runner_commands {
        registry.register(Arc::new(CommandRunner::new(id.clone(), command)?));
    }
    Ok(registry)
}

/// Form the task × input × runner × system product.
///
/// A runner that declares file extensions only measures tasks with one of
/// them. Every task must be measured by at least one runner.
pub fn build_combinations(args: &Args, registry: &RunnerRegistry) -> Result<Vec<Combination>> {
    if args.tasks.is_empty() {
        bail!("At least one --task is required");
    }
    if !args.runner_args.is_empty() {
        bail!("Unexpected arguments: {}", args.runner_args.join(" "));
    }
    check_unique("task", args.tasks.iter().map(|(id, _)| id))?;
    check_unique("input", args.inputs.iter().map(|(id, _)| id))?;
    check_unique("runner", args.runners.iter())?;
    check_unique("system", args.systems.iter())?;

    let runners = args
        .runners
        .iter()
        .map(|id| registry.get(id))
        .collect::<Result<Vec<_>>>()?;
    let inputs = if args.inputs.is_empty() {
        vec![(crate::defaults::INPUT.to_string(), serde_json::Value::Null)]
    } else {
        args.inputs.clone()
    };

    let mut combinations = Vec::new();
    for (task_id, task_path) in &args.tasks {
        let task_runners: Vec<_> = runners
            .iter()
            .filter(|runner| handles(runner.extensions(), task_path))
            .collect();
        if task_runners.is_empty() {
            bail!(
                "No runner handles task '{}' ({}). Runners: {}",
                task_id,
                task_path.display(),
                args.runners.join(", ")
            );
        }

        for (input_id, input) in &inputs {
            for runner in &task_runners {
                for system_id in &args.systems {
                    combinations.push(
                        Combination::new(
                            task_id.clone(),
                            task_path.clone(),
                            input_id.clone(),
                            input.clone(),
                            runner.id(),
                            system_id.clone(),
                        )
                        .with_runner_config(runner.config()),
                    );
                }
            }
        }
    }
    Ok(combinations)
}

fn handles(extensions: &[String], task_path: &Path) -> bool {
    if extensions.is_empty() {
        return true;
    }
    task_path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extensions.iter().any(|candidate| candidate == extension))
}

fn check_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a String>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            bail!("Duplicate {} id '{}'", kind, id);
        }
    }
    Ok(())
}

/// Split "ID=VALUE", requiring a non-empty id.
fn split_assignment<'a>(s: &'a str, what: &str) -> Result<(&'a str, &'a str), String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected {}, got '{}'", what, s))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("Missing id in '{}'", s));
    }
    if id.contains(char::is_whitespace) {
        return Err(format!("Ids cannot contain whitespace: '{}'", id));
    }
    Ok((id, value))
}

fn parse_task(s: &str) -> Result<(String, PathBuf), String> {
    let (id, path) = split_assignment(s, "ID=PATH")?;
    if path.is_empty() {
        return Err(format!("Missing path for task '{}'", id));
    }
    Ok((id.to_string(), PathBuf::from(path)))
}

/// VALUE is JSON when it parses as JSON, a plain string otherwise.
fn parse_input(s: &str) -> Result<(String, serde_json::Value), String> {
    let (id, value) = split_assignment(s, "ID=VALUE")?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((id.to_string(), value))
}

fn parse_runner_command(s: &str) -> Result<(String, String), String> {
    let (id, command) = split_assignment(s, "ID=COMMAND")?;
    if command.trim().is_empty() {
        return Err(format!("Missing command for runner '{}'", id));
    }
    Ok((id.to_string(), command.to_string()))
}

/// Parse a measuring budget: "0" is unbounded, "1" a single sample, anything
/// else a duration.
fn parse_budget(s: &str) -> Result<DurationBudget, String> {
    match s.trim() {
        "0" => Ok(DurationBudget::Unbounded),
        "1" => Ok(DurationBudget::Once),
        other => {
            let duration = parse_duration(other)?;
            if duration.is_zero() {
                Ok(DurationBudget::Unbounded)
            } else {
                Ok(DurationBudget::Limit(duration))
            }
        }
    }
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit_secs) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1e-3)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60.0)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600.0)
    } else {
        (s, 1.0) // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    Duration::try_from_secs_f64(num * unit_secs)
        .map_err(|_| format!("Invalid duration: {}", s))
}
