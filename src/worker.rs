//! # Runner Worker
//!
//! The child-process side of a measurement. A runner process is started as
//!
//! ```text
//! <runner command...> <task path> <JSON params>
//! ```
//!
//! where the JSON params carry the endpoint URL and what to load. The worker
//! then loops on the sample protocol:
//!
//! 1. send the previous result (`{}` the first time, `{"error"}` if loading
//!    failed) and receive an instruction;
//! 2. on `{repeat, maxLoops}`, time `maxLoops` loops of `repeat` task calls,
//!    then, when asked, the same number of empty loops in a separate loop;
//! 3. on `{}`, exit successfully.
//!
//! A failing task call is reported as `{"error"}` and the process exits 1.

use crate::ipc::{Instruction, RpcClient, SampleParams, SampleReturn};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;

/// Environment variable holding the input id for shell tasks.
pub const INPUT_ID_ENV: &str = "COMBENCH_INPUT_ID";

/// Environment variable holding the input value for shell tasks, as JSON.
pub const INPUT_ENV: &str = "COMBENCH_INPUT";

/// Parameters a runner process receives as its last argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnParams {
    pub server_url: String,
    pub runner_config: serde_json::Value,
    pub task_path: PathBuf,
    pub task_id: String,
    pub input_id: String,
    pub input: serde_json::Value,
}

/// One loaded task, callable repeatedly.
pub trait Task {
    fn call(&mut self) -> std::result::Result<(), String>;
}

/// Exit status the process should end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The orchestrator sent the exit instruction.
    Done,
    /// A task call failed and the error was reported.
    TaskFailed,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Done => 0,
            Self::TaskFailed => 1,
        }
    }
}

/// Drive the sample protocol until the orchestrator says to exit.
///
/// `exchange` sends one result and returns the next instruction.
pub fn run_worker<T, F>(task: std::result::Result<T, String>, mut exchange: F) -> Result<WorkerExit>
where
    T: Task,
    F: FnMut(&SampleReturn) -> Result<Instruction>,
{
    let mut task = match task {
        Ok(task) => task,
        Err(error) => {
            exchange(&SampleReturn::error(error))?;
            return Ok(WorkerExit::TaskFailed);
        }
    };

    let mut sample_return = SampleReturn::default();
    loop {
        let params = match exchange(&sample_return)? {
            Instruction::Sample(params) => params,
            Instruction::Exit(_) => return Ok(WorkerExit::Done),
        };

        sample_return = match measure(&mut task, &params) {
            Ok(sample_return) => sample_return,
            Err(error) => {
                exchange(&SampleReturn::error(error))?;
                return Ok(WorkerExit::TaskFailed);
            }
        };
    }
}

fn measure<T: Task>(task: &mut T, params: &SampleParams) -> std::result::Result<SampleReturn, String> {
    let loops = params.max_loops as usize;
    let repeat = params.repeat.max(1);

    let mut main_measures = Vec::with_capacity(loops);
    for _ in 0..loops {
        let start = Instant::now();
        for _ in 0..repeat {
            task.call()?;
        }
        main_measures.push(start.elapsed().as_nanos() as f64);
    }

    let empty_measures = params.empty.then(|| measure_empty(loops));
    Ok(SampleReturn::measures(main_measures, empty_measures))
}

// Kept separate from the main loop so it never shares its optimizations.
#[inline(never)]
fn measure_empty(loops: usize) -> Vec<f64> {
    (0..loops)
        .map(|_| {
            let start = Instant::now();
            black_box(());
            start.elapsed().as_nanos() as f64
        })
        .collect()
}

/// Runs a shell script, with the input exposed through the environment.
#[derive(Debug, Clone)]
pub struct ShellTask {
    path: PathBuf,
    input_id: String,
    input: String,
}

impl ShellTask {
    pub fn load(params: &SpawnParams) -> std::result::Result<Self, String> {
        if !params.task_path.is_file() {
            return Err(format!(
                "Task file '{}' does not exist",
                params.task_path.display()
            ));
        }
        let input = match &params.input {
            serde_json::Value::String(value) => value.clone(),
            value => value.to_string(),
        };
        Ok(Self {
            path: params.task_path.clone(),
            input_id: params.input_id.clone(),
            input,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Task for ShellTask {
    fn call(&mut self) -> std::result::Result<(), String> {
        let status = Command::new("sh")
            .arg(&self.path)
            .env(INPUT_ID_ENV, &self.input_id)
            .env(INPUT_ENV, &self.input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| format!("Could not run 'sh {}': {}", self.path.display(), e))?;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(format!("Task exited with exit code {}", code)),
            None => Err("Task was terminated by a signal".to_string()),
        }
    }
}

/// Entry point of `combench --internal-run-as-runner <id> <task path> <params>`.
pub fn run_builtin_runner(runner_id: &str, args: &[String]) -> Result<WorkerExit> {
    let [_task_path, params] = args else {
        bail!("Expected <task path> <JSON params>, got {} arguments", args.len());
    };
    let params: SpawnParams =
        serde_json::from_str(params).context("Invalid runner parameters")?;
    let client = RpcClient::new(params.server_url.clone())?;

    match runner_id {
        crate::runner::ShellRunner::ID => {
            run_worker(ShellTask::load(&params), |sample_return| client.exchange(sample_return))
        }
        other => bail!("'{}' is not a built-in runner", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct CountingTask {
        calls: u64,
        fail_at: Option<u64>,
    }

    impl Task for CountingTask {
        fn call(&mut self) -> std::result::Result<(), String> {
            self.calls += 1;
            if Some(self.calls) == self.fail_at {
                return Err(format!("failed on call {}", self.calls));
            }
            Ok(())
        }
    }

    fn scripted(
        instructions: Vec<Instruction>,
    ) -> (
        impl FnMut(&SampleReturn) -> Result<Instruction>,
        std::rc::Rc<std::cell::RefCell<Vec<SampleReturn>>>,
    ) {
        let sent = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let log = sent.clone();
        let mut queue: VecDeque<Instruction> = instructions.into();
        let exchange = move |sample_return: &SampleReturn| -> Result<Instruction> {
            log.borrow_mut().push(sample_return.clone());
            Ok(queue.pop_front().unwrap_or_else(Instruction::exit))
        };
        (exchange, sent)
    }

    fn sample(repeat: u64, max_loops: u64, empty: bool) -> Instruction {
        Instruction::Sample(SampleParams {
            repeat,
            max_loops,
            empty,
        })
    }

    #[test]
    fn test_worker_measures_requested_loops() {
        let (exchange, sent) = scripted(vec![sample(3, 4, true), sample(1, 2, false)]);
        let task = CountingTask {
            calls: 0,
            fail_at: None,
        };
        let exit = run_worker(Ok(task), exchange).unwrap();
        assert_eq!(exit, WorkerExit::Done);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], SampleReturn::default());
        assert_eq!(sent[1].main_measures.as_ref().unwrap().len(), 4);
        assert_eq!(sent[1].empty_measures.as_ref().unwrap().len(), 4);
        assert_eq!(sent[2].main_measures.as_ref().unwrap().len(), 2);
        assert!(sent[2].empty_measures.is_none());
        assert!(sent[1].validate().is_ok());
    }

    #[test]
    fn test_worker_reports_task_error() {
        let (exchange, sent) = scripted(vec![sample(1, 5, false), sample(1, 5, false)]);
        let task = CountingTask {
            calls: 0,
            fail_at: Some(3),
        };
        let exit = run_worker(Ok(task), exchange).unwrap();
        assert_eq!(exit, WorkerExit::TaskFailed);
        assert_eq!(exit.code(), 1);

        let sent = sent.borrow();
        assert_eq!(sent.last().unwrap(), &SampleReturn::error("failed on call 3"));
    }

    #[test]
    fn test_worker_reports_load_error() {
        let (exchange, sent) = scripted(vec![]);
        let exit = run_worker::<CountingTask, _>(Err("cannot load".to_string()), exchange).unwrap();
        assert_eq!(exit, WorkerExit::TaskFailed);
        assert_eq!(sent.borrow()[0], SampleReturn::error("cannot load"));
    }

    #[test]
    fn test_spawn_params_wire_format() {
        let params = SpawnParams {
            server_url: "http://127.0.0.1:1/rpc/x".to_string(),
            runner_config: serde_json::json!({}),
            task_path: PathBuf::from("task.sh"),
            task_id: "task".to_string(),
            input_id: "small".to_string(),
            input: serde_json::json!(3),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["serverUrl"], "http://127.0.0.1:1/rpc/x");
        assert_eq!(value["taskPath"], "task.sh");
        assert_eq!(value["inputId"], "small");
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_task_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let ok = dir.path().join("ok.sh");
        std::fs::write(&ok, "test \"$COMBENCH_INPUT\" = \"hello\"\n").unwrap();
        let params = SpawnParams {
            server_url: String::new(),
            runner_config: serde_json::json!({}),
            task_path: ok,
            task_id: "ok".to_string(),
            input_id: "greeting".to_string(),
            input: serde_json::json!("hello"),
        };
        let mut task = ShellTask::load(&params).unwrap();
        assert!(task.call().is_ok());

        let failing = dir.path().join("fail.sh");
        std::fs::write(&failing, "exit 3\n").unwrap();
        let mut task = ShellTask::load(&SpawnParams {
            task_path: failing,
            ..params.clone()
        })
        .unwrap();
        assert_eq!(task.call(), Err("Task exited with exit code 3".to_string()));

        let missing = SpawnParams {
            task_path: dir.path().join("missing.sh"),
            ..params
        };
        assert!(ShellTask::load(&missing).is_err());
    }
}
