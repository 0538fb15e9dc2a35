//! # Runners
//!
//! A runner is the program that loads a task and measures it inside the child
//! process. The engine only needs to know how to start it and whether it can
//! batch several task calls per timed loop.
//!
//! Two kinds are available:
//!
//! - the built-in `shell` runner, which re-executes this binary in runner
//!   mode and runs each task with `sh`;
//! - external command runners registered with `--runner-command ID=COMMAND`,
//!   which receive the same arguments and speak the same protocol.
//!
//! Runners are resolved through a [`RunnerRegistry`] while the configuration
//! is built, so an unknown runner id fails before anything is spawned.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Hidden flag that makes the binary act as a built-in runner.
pub const RUNNER_MODE_FLAG: &str = "--internal-run-as-runner";

const BINARY_NAME: &str = "combench";

/// How to start and drive one kind of runner.
pub trait Runner: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &str;

    /// Program and leading arguments. The task path and the JSON parameters
    /// are appended to it.
    fn spawn_command(&self) -> Result<Vec<OsString>>;

    /// File extensions of the tasks this runner handles.
    fn extensions(&self) -> &[String];

    /// Whether the runner can call a task several times per timed loop.
    fn supports_repeat(&self) -> bool;

    /// Version reported in results, when the runner has one.
    fn version(&self) -> Option<String> {
        None
    }

    /// Runner-specific configuration forwarded to the child.
    fn config(&self) -> serde_json::Value {
        serde_json::Value::Object(Default::default())
    }
}

/// Runs each task call as `sh <task path>`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    extensions: Vec<String>,
}

impl ShellRunner {
    pub const ID: &'static str = "shell";

    pub fn new() -> Self {
        Self {
            extensions: vec!["sh".to_string()],
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for ShellRunner {
    fn id(&self) -> &str {
        Self::ID
    }

    fn spawn_command(&self) -> Result<Vec<OsString>> {
        let binary = resolve_binary()?;
        Ok(vec![
            binary.into_os_string(),
            RUNNER_MODE_FLAG.into(),
            Self::ID.into(),
        ])
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    // Spawning a shell per call dwarfs the cost of taking timestamps.
    fn supports_repeat(&self) -> bool {
        false
    }

    fn version(&self) -> Option<String> {
        Some(crate::VERSION.to_string())
    }
}

/// An external program speaking the sample protocol.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    id: String,
    command: Vec<String>,
    supports_repeat: bool,
    extensions: Vec<String>,
}

impl CommandRunner {
    /// `command` is split on whitespace into the program and its arguments.
    pub fn new(id: impl Into<String>, command: &str) -> Result<Self> {
        let id = id.into();
        let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if command.is_empty() {
            bail!("Runner '{}' has an empty command", id);
        }
        Ok(Self {
            id,
            command,
            supports_repeat: true,
            extensions: Vec::new(),
        })
    }

    pub fn with_repeat(mut self, supports_repeat: bool) -> Self {
        self.supports_repeat = supports_repeat;
        self
    }
}

impl Runner for CommandRunner {
    fn id(&self) -> &str {
        &self.id
    }

    fn spawn_command(&self) -> Result<Vec<OsString>> {
        Ok(self.command.iter().map(OsString::from).collect())
    }

    fn extensions(&self) -> &[String] {
        &self.extensions
    }

    fn supports_repeat(&self) -> bool {
        self.supports_repeat
    }

    fn config(&self) -> serde_json::Value {
        serde_json::json!({ "command": self.command })
    }
}

/// Runners available to a run, by id.
#[derive(Debug, Clone, Default)]
pub struct RunnerRegistry {
    runners: BTreeMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    /// A registry holding the built-in runners.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(ShellRunner::new()));
        registry
    }

    /// Add a runner, replacing any runner with the same id.
    pub fn register(&mut self, runner: Arc<dyn Runner>) {
        self.runners.insert(runner.id().to_string(), runner);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Runner>> {
        self.runners.get(id).cloned().with_context(|| {
            format!(
                "Unknown runner '{}'. Available runners: {}",
                id,
                self.ids().join(", ")
            )
        })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.runners.keys().map(String::as_str).collect()
    }
}

/// Path of the `combench` binary, for re-executing it as a runner.
///
/// Inside tests `current_exe()` is the test harness, so the binary Cargo
/// built for the integration tests, then `target/debug`, are tried next.
pub fn resolve_binary() -> Result<PathBuf> {
    let exe_name = format!("{}{}", BINARY_NAME, std::env::consts::EXE_SUFFIX);

    let current_exe = std::env::current_exe().context("Failed to get current executable path")?;
    if current_exe.file_name().and_then(|n| n.to_str()) == Some(exe_name.as_str()) {
        return Ok(current_exe);
    }

    if let Ok(path) = std::env::var("CARGO_BIN_EXE_combench") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    let fallback = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join("debug")
        .join(&exe_name);
    if fallback.exists() {
        debug!("Using runner binary {}", fallback.display());
        return Ok(fallback);
    }

    bail!(
        "Could not resolve the '{}' binary to run the built-in runner. \
         Build it with `cargo build --bin {}` first.",
        BINARY_NAME,
        BINARY_NAME
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builtins() {
        let registry = RunnerRegistry::with_builtins();
        let shell = registry.get("shell").unwrap();
        assert_eq!(shell.id(), "shell");
        assert!(!shell.supports_repeat());
        assert_eq!(shell.extensions(), &["sh".to_string()]);
        assert_eq!(shell.version().as_deref(), Some(crate::VERSION));
    }

    #[test]
    fn test_registry_unknown_runner() {
        let registry = RunnerRegistry::with_builtins();
        let error = registry.get("python").unwrap_err().to_string();
        assert!(error.contains("Unknown runner 'python'"));
        assert!(error.contains("shell"));
    }

    #[test]
    fn test_command_runner() {
        let runner = CommandRunner::new("node", "node ./runner.js --flag").unwrap();
        assert!(runner.supports_repeat());
        assert_eq!(
            runner.spawn_command().unwrap(),
            vec![
                OsString::from("node"),
                OsString::from("./runner.js"),
                OsString::from("--flag")
            ]
        );
        assert_eq!(
            runner.config(),
            serde_json::json!({"command": ["node", "./runner.js", "--flag"]})
        );

        let runner = runner.with_repeat(false);
        assert!(!runner.supports_repeat());
        assert!(CommandRunner::new("empty", "   ").is_err());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = RunnerRegistry::with_builtins();
        registry.register(Arc::new(CommandRunner::new("shell", "bash").unwrap()));
        assert!(registry.get("shell").unwrap().supports_repeat());
        assert_eq!(registry.ids(), vec!["shell"]);
    }
}
