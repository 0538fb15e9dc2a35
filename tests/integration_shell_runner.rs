#![cfg(unix)]

use combench::combination::DurationBudget;
use combench::{BenchmarkConfig, BenchmarkRunner, Combination, RunnerRegistry, StopController};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

fn write_task(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, script).expect("write task");
    path
}

fn combench(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_combench"))
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("run combench")
}

fn read_results(path: &Path) -> Value {
    let contents = std::fs::read_to_string(path).expect("read results");
    serde_json::from_str(&contents).expect("parse results")
}

#[test]
fn once_budget_measures_each_task_a_single_time() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ok = write_task(dir.path(), "ok.sh", "test \"$COMBENCH_INPUT_ID\" = \"default\"\n");
    let fail = write_task(dir.path(), "fail.sh", "exit 3\n");
    let output_file = dir.path().join("results.json");

    let output = combench(&[
        "-t",
        &format!("ok={}", ok.display()),
        "-t",
        &format!("fail={}", fail.display()),
        "-d",
        "1",
        "--keep-going",
        "-o",
        output_file.to_str().expect("utf-8 path"),
    ]);

    // A failed combination makes the run fail, but results are still written.
    assert!(!output.status.success());
    let results = read_results(&output_file);
    assert_eq!(results["stopped"], false);

    let combinations = results["combinations"].as_array().expect("combinations");
    assert_eq!(combinations.len(), 2);

    let ok = &combinations[0];
    assert_eq!(ok["taskId"], "ok");
    assert!(ok["error"].is_null());
    assert_eq!(ok["samples"], 1);
    assert_eq!(ok["runnerVersion"], env!("CARGO_PKG_VERSION"));
    assert_eq!(ok["loops"], 1);
    assert!(ok["stats"]["median"].as_f64().expect("median") > 0.0);

    let fail = &combinations[1];
    assert_eq!(fail["taskId"], "fail");
    assert_eq!(fail["samples"], 0);
    assert_eq!(fail["error"]["error"]["message"], "Task exited with exit code 3");
}

#[test]
fn failed_task_process_exits_without_being_killed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fail = write_task(dir.path(), "fail.sh", "exit 3\n");
    let output_file = dir.path().join("results.json");

    let started = Instant::now();
    let output = combench(&[
        "-t",
        &format!("fail={}", fail.display()),
        "-d",
        "1",
        "-o",
        output_file.to_str().expect("utf-8 path"),
    ]);
    let elapsed = started.elapsed();

    assert!(!output.status.success());
    // A runner left waiting would only be killed after the one second exit
    // grace.
    assert!(elapsed < Duration::from_millis(900), "run took {:?}", elapsed);
    let results = read_results(&output_file);
    assert_eq!(
        results["combinations"][0]["error"]["error"]["message"],
        "Task exited with exit code 3"
    );
}

#[test]
fn compare_fills_previous_median() {
    let dir = tempfile::tempdir().expect("tempdir");
    let task = write_task(dir.path(), "noop.sh", "true\n");
    let task_arg = format!("noop={}", task.display());
    let first = dir.path().join("first.json");
    let second = dir.path().join("second.json");

    let output = combench(&["-t", &task_arg, "-d", "300ms", "-o", first.to_str().expect("utf-8 path")]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let output = combench(&[
        "-t",
        &task_arg,
        "-d",
        "300ms",
        "-o",
        second.to_str().expect("utf-8 path"),
        "--compare",
        first.to_str().expect("utf-8 path"),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let previous = read_results(&first);
    let current = read_results(&second);
    assert_eq!(
        current["combinations"][0]["previousMedian"],
        previous["combinations"][0]["stats"]["median"]
    );
    assert!(current["combinations"][0]["diff"].is_number());
}

#[test]
fn unknown_task_runner_is_rejected_before_measuring() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output_file = dir.path().join("results.json");
    let output = combench(&[
        "-t",
        "a=a.sh",
        "-r",
        "python",
        "-o",
        output_file.to_str().expect("utf-8 path"),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Unknown runner 'python'"));
    assert!(!output_file.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn library_run_through_shell_runner() {
    // The test harness is not the combench binary: point the shell runner at it.
    std::env::set_var("CARGO_BIN_EXE_combench", env!("CARGO_BIN_EXE_combench"));

    let dir = tempfile::tempdir().expect("tempdir");
    let fast = write_task(dir.path(), "fast.sh", "true\n");
    let slow = write_task(dir.path(), "slow.sh", "sleep 0.02\n");
    let combinations = vec![
        Combination::new("fast", &fast, "default", Value::Null, "shell", "default"),
        Combination::new("slow", &slow, "default", Value::Null, "shell", "default"),
    ];

    let config = BenchmarkConfig {
        budget: DurationBudget::Limit(Duration::from_millis(500)),
        seed: Some(1),
        ..BenchmarkConfig::default()
    };
    let stop = StopController::new(config.abort_grace);
    let runner = BenchmarkRunner::new(config, RunnerRegistry::with_builtins());
    let outcome = runner
        .run(combinations, stop.token())
        .await
        .expect("run completes");

    assert!(!outcome.stopped);
    let fast = &outcome.combinations[0];
    let slow = &outcome.combinations[1];
    for result in [fast, slow] {
        assert!(result.error.is_none(), "{:?}", result.error);
        assert!(result.samples > 1);
        assert_eq!(result.processes, 1);
        assert_eq!(result.runner_version.as_deref(), Some(combench::VERSION));
    }

    let fast_median = fast.stats.as_ref().expect("stats").median;
    let slow_median = slow.stats.as_ref().expect("stats").median;
    assert!(slow_median > fast_median);
    assert!(slow_median >= 20_000_000.0);
}
