//! # Error Types
//!
//! The measurement engine distinguishes errors that belong to a single
//! combination from errors that end the whole run:
//!
//! - [`CombinationError`] marks one combination as failed. Its siblings keep
//!   being measured unless the run was configured to stop on error.
//! - [`CombinationFailure`] is a `CombinationError` tagged with the
//!   combination it happened in, the form in which errors leave the engine.
//! - [`RunError`] is returned by [`crate::BenchmarkRunner::run`] when no
//!   results can be produced at all.
//!
//! The outer layers (CLI, results files) use `anyhow` instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error attributable to exactly one combination.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum CombinationError {
    /// The task failed, the runner could not start, or the process crashed.
    #[error("{0}")]
    User(String),

    /// The child broke the sample protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A sample exchange exceeded the remaining measuring budget.
    #[error("Task \"{task_id}\" timed out. Please increase the \"duration\" configuration property.")]
    Timeout { task_id: String },
}

impl CombinationError {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

/// A [`CombinationError`] together with the combination it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("In task '{task_id}' (input '{input_id}'): {error}")]
#[serde(rename_all = "camelCase")]
pub struct CombinationFailure {
    pub combination_id: String,
    pub task_id: String,
    pub input_id: String,
    pub error: CombinationError,
}

/// Errors that prevent a run from producing any results.
#[derive(Debug, Error)]
pub enum RunError {
    /// The user asked to stop twice, or the grace period expired.
    #[error("Benchmark aborted")]
    Aborted,

    /// The IPC listener could not be set up.
    #[error("Could not start the sample server: {0}")]
    Server(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_task() {
        let error = CombinationError::Timeout {
            task_id: "parse".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Task \"parse\" timed out. Please increase the \"duration\" configuration property."
        );
    }

    #[test]
    fn test_failure_prefix() {
        let failure = CombinationFailure {
            combination_id: "id".to_string(),
            task_id: "sort".to_string(),
            input_id: "large".to_string(),
            error: CombinationError::user("Task exited with exit code 3"),
        };
        assert_eq!(
            failure.to_string(),
            "In task 'sort' (input 'large'): Task exited with exit code 3"
        );
    }

    #[test]
    fn test_protocol_errors_are_distinct() {
        let error = CombinationError::protocol("duplicate outstanding request");
        assert_eq!(error.to_string(), "Protocol error: duplicate outstanding request");
        assert_ne!(error, CombinationError::user("duplicate outstanding request"));
    }

    #[test]
    fn test_serialized_form() {
        let error = CombinationError::user("boom");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "user", "message": "boom"}));
    }
}
