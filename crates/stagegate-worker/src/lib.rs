//! Outbound resume delivery to the analysis worker.
//!
//! A checkpoint decision that unblocks the worker is delivered as a single
//! `POST {base_url}/resume`, retried with bounded exponential backoff. The
//! transport is a trait so coordination code and tests can substitute a
//! recording mock.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagegate_types::{CheckpointDecision, CheckpointKind, RunId};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("transport failure: {0}")]
    Transport(String),

    /// Non-retryable HTTP status from the worker (4xx).
    #[error("worker rejected resume with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("resume delivery exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Body of the outbound resume call. The idempotency key is the one the
/// worker supplied with `checkpoint_requested`, so the worker can correlate
/// the resume to its own pause point and drop duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub run_id: RunId,
    pub checkpoint_type: CheckpointKind,
    pub idempotency_key: String,
    pub decision: CheckpointDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Delivery seam for resume calls.
#[async_trait]
pub trait ResumeTransport: Send + Sync {
    async fn resume(&self, request: &ResumeRequest) -> Result<(), WorkerError>;
}

/// HTTP transport with exponential backoff.
///
/// Retries transport errors and 5xx responses; a 4xx response is treated
/// as a permanent rejection and returned immediately.
pub struct HttpResumeClient {
    client: reqwest::Client,
    base_url: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl HttpResumeClient {
    #[must_use]
    pub fn new(base_url: String, max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    async fn attempt(&self, request: &ResumeRequest) -> Result<(), WorkerError> {
        let url = format!("{}/resume", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| WorkerError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            return Err(WorkerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Err(WorkerError::Transport(format!(
            "server error {status}: {body}"
        )))
    }
}

#[async_trait]
impl ResumeTransport for HttpResumeClient {
    async fn resume(&self, request: &ResumeRequest) -> Result<(), WorkerError> {
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self.attempt(request).await {
                Ok(()) => {
                    debug!(
                        run_id = %request.run_id,
                        checkpoint_type = %request.checkpoint_type,
                        attempt,
                        "resume delivered"
                    );
                    return Ok(());
                }
                Err(err @ WorkerError::Status { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        run_id = %request.run_id,
                        attempt,
                        error = %err,
                        "resume attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(WorkerError::Exhausted {
            attempts: self.max_attempts,
            last_error,
        })
    }
}
