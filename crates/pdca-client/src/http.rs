use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pdca_core::{JobHandle, JobKind};
use reqwest::header::LOCATION;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{
    classify_reqwest_error, classify_status, BackoffPolicy, ClientError, PollOutcome,
    RemoteJobClient, RetryDisposition, SubmitError,
};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// `reqwest`-backed client for the PDCA REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpRemoteClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute locations are used as-is; anything else hangs off the base URL.
    pub fn resolve_location(&self, location: &str) -> String {
        if Url::parse(location).is_ok() {
            return location.to_string();
        }
        format!("{}/{}", self.base_url, location.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Sends the request built by `build`, retrying transport failures and
    /// retryable statuses. The final response is returned whatever its status.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, ClientError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, url = %resp.url(), "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ClientError::Transport(err));
                }
            }
        }
    }

    async fn read_json(resp: Response) -> Result<JsonValue, ClientError> {
        let url = resp.url().to_string();
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| ClientError::InvalidJson { url, source })
    }

    async fn status_error(resp: Response) -> ClientError {
        let status = resp.status().as_u16();
        let url = resp.url().to_string();
        let body = resp.text().await.unwrap_or_default();
        ClientError::HttpStatus {
            status,
            url,
            message: rejection_message(&body),
        }
    }

    async fn get_service_json(&self, endpoint: &str) -> Result<JsonValue, ClientError> {
        let url = self.resolve_location(endpoint);
        let resp = self
            .send_with_retry(|| self.authorize(self.client.get(&url)))
            .await?;
        if !resp.status().is_success() {
            return Err(Self::status_error(resp).await);
        }
        Self::read_json(resp).await
    }

    /// `GET {base}/management/health`.
    pub async fn health(&self) -> Result<JsonValue, ClientError> {
        self.get_service_json("management/health").await
    }

    /// `GET {base}/credits`.
    pub async fn credits(&self) -> Result<JsonValue, ClientError> {
        self.get_service_json("credits").await
    }
}

#[async_trait]
impl RemoteJobClient for HttpRemoteClient {
    async fn submit(
        &self,
        kind: JobKind,
        payload: &JsonValue,
        schema: u32,
    ) -> Result<JobHandle, SubmitError> {
        let url = format!("{}/{}?schema={schema}", self.base_url, kind.endpoint());
        info!(%kind, schema, "submit");
        let resp = self
            .send_with_retry(|| self.authorize(self.client.post(&url).json(payload)))
            .await?;

        let status = resp.status();
        if status != StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected {
                kind,
                status: status.as_u16(),
                message: rejection_message(&body),
            });
        }

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ClientError::MissingLocation { url: url.clone() })?;
        let handle = JobHandle(self.resolve_location(location));
        debug!(%handle, "result location");
        Ok(handle)
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollOutcome, ClientError> {
        let url = handle.as_str();
        let resp = self
            .send_with_retry(|| self.authorize(self.client.get(url)))
            .await?;

        match resp.status() {
            StatusCode::ACCEPTED => Ok(PollOutcome::NotReady),
            StatusCode::OK => {
                let download = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .map(|location| self.resolve_location(location));
                match download {
                    Some(download) => {
                        debug!(%download, "fetching result from location");
                        // Pre-signed locations carry their own credentials.
                        let resp = self
                            .send_with_retry(|| self.client.get(&download))
                            .await?;
                        if !resp.status().is_success() {
                            return Err(Self::status_error(resp).await);
                        }
                        Ok(PollOutcome::Ready(Self::read_json(resp).await?))
                    }
                    None => Ok(PollOutcome::Ready(Self::read_json(resp).await?)),
                }
            }
            _ => Err(Self::status_error(resp).await),
        }
    }
}

/// Human-readable message from an error body: `message`, `error` or `errors`,
/// followed by `details` when present. Non-JSON bodies are returned verbatim.
pub fn rejection_message(body: &str) -> String {
    let Ok(content) = serde_json::from_str::<JsonValue>(body) else {
        return body.trim().to_string();
    };
    let Some(object) = content.as_object() else {
        return content.to_string();
    };

    let message = ["message", "error", "errors"]
        .iter()
        .find_map(|key| object.get(*key))
        .unwrap_or(&content);
    let mut text = match message {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    match object.get("details") {
        None | Some(JsonValue::Null) => {}
        Some(JsonValue::String(details)) => text = format!("{text} - {details}"),
        Some(details) => text = format!("{text} - {details}"),
    }
    text
}
