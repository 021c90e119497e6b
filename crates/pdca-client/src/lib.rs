//! Remote job client contract for the PDCA match/augment service.

use std::time::Duration;

use async_trait::async_trait;
use pdca_core::{JobHandle, JobKind};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;

mod http;
#[cfg(feature = "test-util")]
pub mod scripted;

pub use http::{rejection_message, HttpClientConfig, HttpRemoteClient};
#[cfg(feature = "test-util")]
pub use scripted::ScriptedRemoteClient;

pub const CRATE_NAME: &str = "pdca-client";

/// Result of a single, non-blocking status check.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    NotReady,
    Ready(JsonValue),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },
    #[error("{url} answered 201 without a Location header")]
    MissingLocation { url: String },
    #[error("invalid JSON from {url}: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    /// The service refused the request outright. Callers may retry later.
    #[error("{kind} submission rejected with status {status}: {message}")]
    Rejected {
        kind: JobKind,
        status: u16,
        message: String,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Submits match/augment requests and polls their handles.
#[async_trait]
pub trait RemoteJobClient: Send + Sync {
    /// Returns as soon as the service has accepted the request.
    async fn submit(
        &self,
        kind: JobKind,
        payload: &JsonValue,
        schema: u32,
    ) -> Result<JobHandle, SubmitError>;

    /// Single status check; never waits for the job to finish.
    async fn poll(&self, handle: &JobHandle) -> Result<PollOutcome, ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
