//! # Process Supervisor
//!
//! Spawns one runner process per combination and turns whatever happens to it
//! into a [`CombinationError`] tagged with that combination.
//!
//! ## Spawning
//!
//! The child is started as `<runner command...> <task path> <JSON params>`,
//! with every standard stream detached: all communication goes through the
//! sample server. The JSON params carry the endpoint URL and what to load
//! (see [`SpawnParams`]).
//!
//! ## Exit Watching
//!
//! A background task owns the child. It waits for the child to exit, or for a
//! kill request, and publishes an [`ExitInfo`] on a `watch` channel. Every
//! wait on the child's endpoint is raced against that channel, so a crash
//! surfaces immediately instead of as a hung request.
//!
//! ## Termination
//!
//! [`terminate`] asks the background task to kill the child and waits a
//! bounded time for the exit. It is idempotent, and [`terminate_all`] applies
//! it to many processes at once. Dropping a [`RunnerProcess`]
//! kills the child as well, which is how an aborted run cleans up.

use crate::combination::Combination;
use crate::error::CombinationError;
use crate::ipc::{Instruction, RpcEndpoint, SampleBatch, SampleChannel, SampleParams};
use crate::runner::Runner;
use crate::worker::SpawnParams;
use async_trait::async_trait;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// How long `terminate` waits for a killed child to be reaped.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a child told to exit gets to do so before it is killed.
const EXIT_TIMEOUT: Duration = Duration::from_secs(1);

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// The error reported when the child exits while it is still expected to
    /// answer.
    pub fn into_error(self) -> CombinationError {
        match (self.code, self.signal) {
            (Some(code), _) => CombinationError::user(format!("Task exited with exit code {}", code)),
            (None, Some(signal)) => CombinationError::user(format!(
                "Task was terminated by signal {}",
                signal_name(signal)
            )),
            (None, None) => CombinationError::user("Task exited unexpectedly"),
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|signal| signal.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    signal.to_string()
}

/// Handle on a spawned runner process.
#[derive(Debug)]
pub struct RunnerProcess {
    combination_id: String,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill: Option<oneshot::Sender<()>>,
}

impl RunnerProcess {
    pub fn combination_id(&self) -> &str {
        &self.combination_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, if the process has already exited.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    /// Wait until the process exits.
    pub async fn wait(&mut self) -> ExitInfo {
        wait_exit(&mut self.exit).await
    }
}

/// Spawn the runner process of `combination`, reporting to `server_origin`.
pub fn spawn(
    combination: &Combination,
    runner: &dyn Runner,
    server_origin: &str,
) -> Result<RunnerProcess, CombinationError> {
    let mut command_line = runner
        .spawn_command()
        .map_err(|e| CombinationError::user(format!("{:#}", e)))?
        .into_iter();
    let program = command_line
        .next()
        .ok_or_else(|| CombinationError::user(format!("Runner '{}' has no command", runner.id())))?;

    let params = SpawnParams {
        server_url: format!("{}/rpc/{}", server_origin, combination.id),
        runner_config: combination.runner_config.clone(),
        task_path: combination.task_path.clone(),
        task_id: combination.task_id.clone(),
        input_id: combination.input_id.clone(),
        input: combination.input.clone(),
    };
    let params = serde_json::to_string(&params)
        .map_err(|e| CombinationError::user(format!("Could not serialize runner parameters: {}", e)))?;

    let mut child = Command::new(&program)
        .args(command_line)
        .arg(&combination.task_path)
        .arg(params)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            CombinationError::user(format!(
                "Runner command '{}' could not be started: {}",
                program.to_string_lossy(),
                e
            ))
        })?;

    let pid = child.id();
    debug!(
        "Spawned runner '{}' for task '{}' (pid {:?})",
        runner.id(),
        combination.task_id,
        pid
    );

    let (exit_sender, exit) = watch::channel(None);
    let (kill, kill_request) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            // A dropped handle counts as a kill request.
            _ = kill_request => {
                if let Err(e) = child.start_kill() {
                    debug!("Kill request for an exited runner: {}", e);
                }
                child.wait().await
            }
        };
        let info = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => {
                warn!("Could not wait for runner process: {}", e);
                ExitInfo::unknown()
            }
        };
        let _ = exit_sender.send(Some(info));
    });

    Ok(RunnerProcess {
        combination_id: combination.id.clone(),
        pid,
        exit,
        kill: Some(kill),
    })
}

/// Kill the process, if it is still running, and wait for it to be reaped.
pub async fn terminate(process: &mut RunnerProcess) {
    if let Some(kill) = process.kill.take() {
        let _ = kill.send(());
    }
    if tokio::time::timeout(TERMINATE_TIMEOUT, process.wait())
        .await
        .is_err()
    {
        warn!(
            "Runner process {:?} did not exit after being killed",
            process.pid
        );
    }
}

/// Terminate every process concurrently.
pub async fn terminate_all<'a>(processes: impl IntoIterator<Item = &'a mut RunnerProcess>) {
    futures::future::join_all(processes.into_iter().map(|process| terminate(process))).await;
}

async fn wait_exit(exit: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    loop {
        if let Some(info) = *exit.borrow_and_update() {
            return info;
        }
        if exit.changed().await.is_err() {
            return (*exit.borrow()).unwrap_or_else(ExitInfo::unknown);
        }
    }
}

/// Run `operation`, failing early if the process exits first.
async fn race_exit<T>(
    exit: &mut watch::Receiver<Option<ExitInfo>>,
    operation: impl Future<Output = Result<T, CombinationError>>,
) -> Result<T, CombinationError> {
    tokio::select! {
        biased;
        result = operation => result,
        info = wait_exit(exit) => Err(info.into_error()),
    }
}

/// [`SampleChannel`] backed by a real runner process.
pub struct ProcessChannel {
    endpoint: RpcEndpoint,
    process: RunnerProcess,
}

impl ProcessChannel {
    pub fn new(endpoint: RpcEndpoint, process: RunnerProcess) -> Self {
        Self { endpoint, process }
    }

    pub fn process_mut(&mut self) -> &mut RunnerProcess {
        &mut self.process
    }
}

#[async_trait]
impl SampleChannel for ProcessChannel {
    async fn start(&mut self) -> Result<(), CombinationError> {
        let endpoint = &mut self.endpoint;
        race_exit(&mut self.process.exit, endpoint.receive())
            .await?
            .into_ready()
    }

    async fn sample(&mut self, params: SampleParams) -> Result<SampleBatch, CombinationError> {
        let endpoint = &mut self.endpoint;
        race_exit(
            &mut self.process.exit,
            endpoint.exchange(Instruction::Sample(params)),
        )
        .await?
        .into_batch()
    }

    async fn end(&mut self) -> Result<(), CombinationError> {
        self.endpoint.respond(Instruction::exit())
    }

    async fn close(&mut self) {
        // A child that reported an error still waits for an answer before
        // exiting on its own.
        if self.endpoint.has_pending() {
            let _ = self.endpoint.respond(Instruction::exit());
        }
        if tokio::time::timeout(EXIT_TIMEOUT, self.process.wait())
            .await
            .is_err()
        {
            debug!(
                "Runner process {:?} still running, killing it",
                self.process.pid
            );
        }
        terminate(&mut self.process).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::{RpcClient, RpcServer, SampleReturn};
    use crate::runner::CommandRunner;
    use serde_json::json;

    /// `sh -c <task path>` runs the task path itself as a script.
    fn inline_shell() -> CommandRunner {
        CommandRunner::new("inline", "sh -c").unwrap()
    }

    fn combination(script: &str) -> Combination {
        Combination::new("task", script, "input", json!(null), "inline", "default")
    }

    async fn start(script: &str) -> Result<(), CombinationError> {
        let server = RpcServer::bind().await.unwrap();
        let combination = combination(script);
        let endpoint = server.register(&combination.id);
        let process = spawn(&combination, &inline_shell(), server.origin())?;
        let mut channel = ProcessChannel::new(endpoint, process);
        let result = channel.start().await;
        terminate(channel.process_mut()).await;
        drop(channel);
        server.shutdown().await;
        result
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        assert_eq!(
            start("exit 3").await,
            Err(CombinationError::user("Task exited with exit code 3"))
        );
    }

    #[tokio::test]
    async fn test_signal_is_reported() {
        assert_eq!(
            start("kill -SEGV $$").await,
            Err(CombinationError::user("Task was terminated by signal SIGSEGV"))
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let runner = CommandRunner::new("missing", "/nonexistent/runner-binary").unwrap();
        let error = spawn(&combination("true"), &runner, "http://127.0.0.1:1").unwrap_err();
        match error {
            CombinationError::User(message) => {
                assert!(message.starts_with("Runner command '/nonexistent/runner-binary' could not be started"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_answers_request_left_by_failed_task() {
        let server = RpcServer::bind().await.unwrap();
        let combination = combination("sleep 30");
        let endpoint = server.register(&combination.id);
        let url = server.url(&combination.id);
        let process = spawn(&combination, &inline_shell(), server.origin()).unwrap();
        let mut channel = ProcessChannel::new(endpoint, process);

        let child = tokio::task::spawn_blocking(move || {
            RpcClient::new(url)?.exchange(&SampleReturn::error("task failed"))
        });
        assert_eq!(channel.start().await, Err(CombinationError::user("task failed")));

        channel.close().await;
        let instruction = child.await.unwrap().unwrap();
        assert_eq!(instruction, Instruction::exit());
        assert!(channel.process_mut().exit_info().is_some());
        drop(channel);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut process = spawn(&combination("sleep 30"), &inline_shell(), "http://127.0.0.1:1").unwrap();
        assert!(process.exit_info().is_none());

        terminate(&mut process).await;
        let info = process.exit_info().unwrap();
        assert_eq!(info.signal, Some(nix::sys::signal::Signal::SIGKILL as i32));

        terminate(&mut process).await;
        assert_eq!(process.exit_info(), Some(info));
    }

    #[tokio::test]
    async fn test_terminate_all_kills_every_process() {
        let mut processes: Vec<RunnerProcess> = (0..3)
            .map(|_| spawn(&combination("sleep 30"), &inline_shell(), "http://127.0.0.1:1").unwrap())
            .collect();

        terminate_all(processes.iter_mut()).await;
        for process in &processes {
            assert!(process.exit_info().is_some());
        }
    }

    #[test]
    fn test_exit_info_messages() {
        let info = ExitInfo {
            code: None,
            signal: Some(15),
        };
        assert_eq!(
            info.into_error(),
            CombinationError::user("Task was terminated by signal SIGTERM")
        );
        assert_eq!(
            ExitInfo::unknown().into_error(),
            CombinationError::user("Task exited unexpectedly")
        );
    }
}
