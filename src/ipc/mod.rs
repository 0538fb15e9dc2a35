use crate::error::CombinationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod client;
pub mod server;

pub use client::RpcClient;
pub use server::{RpcEndpoint, RpcServer};

/// Instruction for one sample, sent to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleParams {
    /// Task iterations per timed loop.
    pub repeat: u64,
    /// Number of timed loops in this sample.
    pub max_loops: u64,
    /// Also measure the empty loop, in a separate loop after the main one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty: bool,
}

/// Empty JSON object, the exit instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Exit {}

/// Response body of `POST /rpc/{id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instruction {
    Sample(SampleParams),
    Exit(Exit),
}

impl Instruction {
    pub fn exit() -> Self {
        Self::Exit(Exit {})
    }
}

/// Request body of `POST /rpc/{id}`: the result of the previous sample.
///
/// `{}` on the first request, `{"error": ...}` when the task failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleReturn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_measures: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_measures: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SampleReturn {
    pub fn measures(main_measures: Vec<f64>, empty_measures: Option<Vec<f64>>) -> Self {
        Self {
            main_measures: Some(main_measures),
            empty_measures,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Check every measure is a finite, non-negative duration.
    pub fn validate(&self) -> Result<(), CombinationError> {
        let measures = self.main_measures.iter().chain(self.empty_measures.iter()).flatten();
        for measure in measures {
            if !measure.is_finite() || *measure < 0.0 {
                return Err(CombinationError::protocol(format!(
                    "invalid measure {}",
                    measure
                )));
            }
        }
        Ok(())
    }

    /// Result of the first request, which carries nothing but a possible
    /// load error.
    pub fn into_ready(self) -> Result<(), CombinationError> {
        match self {
            Self { error: Some(error), .. } => Err(CombinationError::User(error)),
            Self {
                main_measures: Some(_),
                ..
            } => Err(CombinationError::protocol("measures received before any sample")),
            _ => Ok(()),
        }
    }

    /// Result of a sample request.
    pub fn into_batch(self) -> Result<SampleBatch, CombinationError> {
        if let Some(error) = self.error {
            return Err(CombinationError::User(error));
        }
        self.validate()?;

        match self.main_measures {
            Some(main_measures) if !main_measures.is_empty() => Ok(SampleBatch {
                main_measures,
                empty_measures: self.empty_measures.unwrap_or_default(),
            }),
            Some(_) => Err(CombinationError::protocol("empty sample")),
            None => Err(CombinationError::protocol("missing mainMeasures")),
        }
    }
}

/// Validated raw timings of one sample, in nanoseconds per loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub main_measures: Vec<f64>,
    pub empty_measures: Vec<f64>,
}

/// One combination's side of the sample protocol, as seen by the scheduler.
///
/// A channel never has more than one exchange in flight: each method is
/// awaited to completion before the next is called.
#[async_trait]
pub trait SampleChannel: Send {
    /// Wait until the child has loaded its task and asks for work.
    async fn start(&mut self) -> Result<(), CombinationError>;

    /// Run one sample.
    async fn sample(&mut self, params: SampleParams) -> Result<SampleBatch, CombinationError>;

    /// Tell the child to exit.
    async fn end(&mut self) -> Result<(), CombinationError>;

    /// Release whatever backs the channel. Called once, after `end`.
    async fn close(&mut self) {}
}
