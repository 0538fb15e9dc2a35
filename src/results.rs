use crate::benchmark::BenchmarkOutcome;
use crate::combination::{CombinationResult, DurationBudget};
use crate::stats::welch_significant;
use crate::utils::{format_percent, format_stats, generate_run_id, get_cpu_cores};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Everything a run produced, as written to the output file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResults {
    pub id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// The run was stopped before every budget was spent.
    pub stopped: bool,
    pub budget: DurationBudget,
    pub precision_target: Option<f64>,
    pub system_info: SystemInfo,
    pub combinations: Vec<CombinationReport>,
}

/// One combination's result, with its comparison against a previous run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinationReport {
    #[serde(flatten)]
    pub result: CombinationResult,
    /// Median of the same combination in the previous run.
    pub previous_median: Option<f64>,
    /// `median / previous_median - 1`.
    pub diff: Option<f64>,
    /// Whether `diff` is statistically significant (Welch's t-test).
    pub significant: Option<bool>,
}

impl From<CombinationResult> for CombinationReport {
    fn from(result: CombinationResult) -> Self {
        Self {
            result,
            previous_median: None,
            diff: None,
            significant: None,
        }
    }
}

impl CombinationReport {
    /// Whether `other` measured the same task, input, runner and system.
    fn matches(&self, other: &CombinationReport) -> bool {
        let (current, previous) = (&self.result, &other.result);
        current.task_id == previous.task_id
            && current.input_id == previous.input_id
            && current.runner_id == previous.runner_id
            && current.system_id == previous.system_id
    }

    fn compare(&mut self, previous: &CombinationReport) {
        let (Some(current), Some(previous)) = (&self.result.stats, &previous.result.stats) else {
            return;
        };
        self.previous_median = Some(previous.median);
        if previous.median != 0.0 {
            self.diff = Some(current.median / previous.median - 1.0);
        }
        self.significant = match (current.summary(), previous.summary()) {
            (Some(current), Some(previous)) => Some(welch_significant(&current, &previous)),
            _ => None,
        };
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: get_cpu_cores(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

impl BenchmarkResults {
    pub fn new(outcome: BenchmarkOutcome, budget: DurationBudget, precision_target: Option<f64>) -> Self {
        Self {
            id: generate_run_id(),
            timestamp: chrono::Utc::now(),
            stopped: outcome.stopped,
            budget,
            precision_target,
            system_info: SystemInfo::default(),
            combinations: outcome
                .combinations
                .into_iter()
                .map(CombinationReport::from)
                .collect(),
        }
    }

    /// Number of combinations that failed.
    pub fn failure_count(&self) -> usize {
        self.combinations
            .iter()
            .filter(|report| report.result.error.is_some())
            .count()
    }
}

/// Results manager for writing, loading and comparing results files
pub struct ResultsManager {
    output_file: PathBuf,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
        }
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    /// Write `results` as pretty-printed JSON, replacing the output file
    pub fn write(&self, results: &BenchmarkResults) -> Result<()> {
        if let Some(parent) = self.output_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(&self.output_file)
            .with_context(|| format!("Failed to create {}", self.output_file.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, results)?;
        writeln!(writer)?;
        writer.flush()?;

        info!("Results written to {}", self.output_file.display());
        Ok(())
    }

    /// Load a results file written by a previous run
    pub fn load(path: &Path) -> Result<BenchmarkResults> {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("{} is not a results file", path.display()))
    }
}

/// Fill `previous_median`, `diff` and `significant` for every combination
/// that also appears in `previous`.
pub fn compare_with_previous(results: &mut BenchmarkResults, previous: &BenchmarkResults) {
    for report in &mut results.combinations {
        match previous
            .combinations
            .iter()
            .find(|candidate| report.matches(candidate))
        {
            Some(previous) => report.compare(previous),
            None => debug!(
                "No previous result for task '{}' (input '{}')",
                report.result.task_id, report.result.input_id
            ),
        }
    }
}

/// Log one line per combination.
pub fn log_summary(results: &BenchmarkResults) {
    for report in &results.combinations {
        let result = &report.result;
        let title = format!("{} ({})", result.task_id, result.input_id);

        if let Some(failure) = &result.error {
            error!("{}: {}", title, failure);
            continue;
        }
        let Some(stats) = &result.stats else {
            info!("{}: no measures", title);
            continue;
        };

        let diff = match (report.diff, report.significant) {
            (Some(diff), Some(true)) => format!("  {}", format_percent(diff)),
            (Some(diff), _) => format!("  {} (not significant)", format_percent(diff)),
            (None, _) => String::new(),
        };
        info!("{}: {}{}", title, format_stats(stats), diff);
    }

    if results.stopped {
        info!("Benchmark stopped before the end of its budget");
    }
}
