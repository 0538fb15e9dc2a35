//! Child side of the sample protocol.
//!
//! Runners are plain synchronous programs, so the client is blocking. There is
//! no request timeout: a request legitimately waits while other combinations
//! are measured.

use super::{Instruction, SampleReturn};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use std::time::Duration;

pub struct RpcClient {
    client: Client,
    url: String,
}

impl RpcClient {
    /// `url` is the full endpoint URL, `<origin>/rpc/<id>`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(None::<Duration>)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Send the result of the previous sample and wait for the next
    /// instruction.
    pub fn exchange(&self, sample_return: &SampleReturn) -> Result<Instruction> {
        let response = self
            .client
            .post(&self.url)
            .json(sample_return)
            .send()
            .with_context(|| format!("Failed to reach {}", self.url))?
            .error_for_status()
            .context("Sample request rejected")?;
        response
            .json::<Instruction>()
            .context("Malformed instruction from the sample server")
    }
}
