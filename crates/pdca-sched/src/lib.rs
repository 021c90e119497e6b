//! Run configuration, the tick-driven Scheduler, the Coordinator and the post-run passes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pdca_client::{BackoffPolicy, ClientError, HttpClientConfig};
use pdca_core::{ConfigError, InputRow, PayloadError, TransitionError};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::fs;

mod coordinator;
mod export;
mod reconcile;
mod scheduler;

pub use coordinator::{Coordinator, RunSummary};
pub use export::{merge, unique_identifiers};
pub use reconcile::{reconcile, ReconcileError, ReconcileSummary};
pub use scheduler::{FailedBatch, RunStats, Scheduler, SchedulerSettings};

pub const CRATE_NAME: &str = "pdca-sched";

pub const ENV_BASE_URL: &str = "PDCA_BASE_URL";
pub const ENV_API_TOKEN: &str = "PDCA_API_TOKEN";
pub const ENV_INPUT_FILE: &str = "PDCA_INPUT_FILE";
pub const ENV_OUTPUT_DIR: &str = "PDCA_OUTPUT_DIR";
pub const ENV_MATCH_SCHEMA: &str = "PDCA_MATCH_SCHEMA";
pub const ENV_AUGMENT_SCHEMA: &str = "PDCA_AUGMENT_SCHEMA";
pub const ENV_BATCH_SIZE: &str = "PDCA_BATCH_SIZE";
pub const ENV_SIMULTANEOUS_BATCHES: &str = "PDCA_SIMULTANEOUS_BATCHES";
pub const ENV_POLL_INTERVAL_SECS: &str = "PDCA_POLL_INTERVAL_SECS";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "PDCA_HTTP_TIMEOUT_SECS";
pub const ENV_MAX_SUBMIT_ATTEMPTS: &str = "PDCA_MAX_SUBMIT_ATTEMPTS";
pub const ENV_MATCH_PARAMS_FILE: &str = "PDCA_MATCH_PARAMS_FILE";
pub const ENV_USER_AGENT: &str = "PDCA_USER_AGENT";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("remote service failure: {0}")]
    Client(#[from] ClientError),
    #[error("batch {batch_number}: {source}")]
    Payload {
        batch_number: usize,
        #[source]
        source: PayloadError,
    },
    #[error("run interrupted with {pending} batch(es) not yet terminal")]
    Interrupted { pending: usize },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Everything a run needs, resolved from the environment and then from CLI overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    pub match_schema: u32,
    pub augment_schema: u32,
    pub batch_size: usize,
    /// `None` disables the ceiling.
    pub simultaneous_batches: Option<usize>,
    pub poll_interval: Duration,
    pub http_timeout: Duration,
    /// `None` retries rejected submissions forever.
    pub max_submit_attempts: Option<u32>,
    pub match_params_file: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/pdca".to_string(),
            api_token: None,
            input_file: PathBuf::from("api_input.csv"),
            output_dir: PathBuf::from("output"),
            match_schema: 1,
            augment_schema: 1,
            batch_size: 100,
            simultaneous_batches: Some(5),
            poll_interval: Duration::from_secs(5),
            http_timeout: Duration::from_secs(20),
            max_submit_attempts: Some(5),
            match_params_file: None,
            user_agent: "pdca-runner/0.1".to_string(),
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RunConfig::from_env`] but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_BASE_URL) {
            config.base_url = v;
        }
        config.api_token = lookup(ENV_API_TOKEN).filter(|v| !v.is_empty());
        if let Some(v) = lookup(ENV_INPUT_FILE) {
            config.input_file = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_OUTPUT_DIR) {
            config.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_MATCH_SCHEMA) {
            config.match_schema = parse_number(ENV_MATCH_SCHEMA, &v)?;
        }
        if let Some(v) = lookup(ENV_AUGMENT_SCHEMA) {
            config.augment_schema = parse_number(ENV_AUGMENT_SCHEMA, &v)?;
        }
        if let Some(v) = lookup(ENV_BATCH_SIZE) {
            config.batch_size = parse_number(ENV_BATCH_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_SIMULTANEOUS_BATCHES) {
            config.simultaneous_batches = parse_ceiling(ENV_SIMULTANEOUS_BATCHES, &v)?;
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL_SECS) {
            config.poll_interval = Duration::from_secs(parse_number(ENV_POLL_INTERVAL_SECS, &v)?);
        }
        if let Some(v) = lookup(ENV_HTTP_TIMEOUT_SECS) {
            config.http_timeout = Duration::from_secs(parse_number(ENV_HTTP_TIMEOUT_SECS, &v)?);
        }
        if let Some(v) = lookup(ENV_MAX_SUBMIT_ATTEMPTS) {
            config.max_submit_attempts = parse_attempts(ENV_MAX_SUBMIT_ATTEMPTS, &v)?;
        }
        config.match_params_file = lookup(ENV_MATCH_PARAMS_FILE)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        if let Some(v) = lookup(ENV_USER_AGENT) {
            config.user_agent = v;
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_BATCH_SIZE,
                value: "0".to_string(),
            });
        }
        if self.simultaneous_batches == Some(0) {
            return Err(ConfigError::Invalid {
                key: ENV_SIMULTANEOUS_BATCHES,
                value: "0".to_string(),
            });
        }
        if self.max_submit_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                key: ENV_MAX_SUBMIT_ATTEMPTS,
                value: "0".to_string(),
            });
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_BASE_URL));
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.base_url.clone(),
            bearer_token: self.api_token.clone(),
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Extra match request fields from the YAML file, or an empty map when none is configured.
    pub async fn load_match_params(&self) -> Result<JsonMap<String, JsonValue>> {
        let Some(path) = &self.match_params_file else {
            return Ok(JsonMap::new());
        };
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading match params {}", path.display()))?;
        let value: JsonValue = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing match params {}", path.display()))?;
        match value {
            JsonValue::Object(map) => Ok(map),
            JsonValue::Null => Ok(JsonMap::new()),
            _ => anyhow::bail!("match params {} must be a YAML mapping", path.display()),
        }
    }

    pub fn limit_label(&self) -> String {
        ceiling_label(self.simultaneous_batches)
    }
}

pub(crate) fn ceiling_label(limit: Option<usize>) -> String {
    limit.map_or_else(|| "unlimited".to_string(), |n| n.to_string())
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// `-1` or `unlimited` lift the ceiling; `0` would admit nothing and is rejected.
pub fn parse_ceiling(key: &'static str, value: &str) -> Result<Option<usize>, ConfigError> {
    match value.trim() {
        "-1" | "unlimited" => Ok(None),
        other => match parse_number::<usize>(key, other)? {
            0 => Err(ConfigError::Invalid {
                key,
                value: value.to_string(),
            }),
            n => Ok(Some(n)),
        },
    }
}

/// `0` or `unlimited` keep retrying rejected submissions forever.
pub fn parse_attempts(key: &'static str, value: &str) -> Result<Option<u32>, ConfigError> {
    match value.trim() {
        "0" | "unlimited" => Ok(None),
        other => parse_number::<u32>(key, other).map(Some),
    }
}

/// Reads the header + rows CSV into ordered rows keyed by header.
///
/// Short records simply lack the trailing columns.
pub async fn load_input_rows(path: &Path) -> Result<Vec<InputRow>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading input file {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record
            .with_context(|| format!("parsing record {} of {}", index + 1, path.display()))?;
        let row: InputRow = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.to_string(), value.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = RunConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.simultaneous_batches, Some(5));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn ceiling_and_attempts_accept_unlimited_spellings() {
        let config = RunConfig::from_lookup(lookup(&[
            (ENV_SIMULTANEOUS_BATCHES, "-1"),
            (ENV_MAX_SUBMIT_ATTEMPTS, "0"),
            (ENV_BATCH_SIZE, "250"),
        ]))
        .unwrap();
        assert_eq!(config.simultaneous_batches, None);
        assert_eq!(config.max_submit_attempts, None);
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.limit_label(), "unlimited");

        let config = RunConfig::from_lookup(lookup(&[
            (ENV_SIMULTANEOUS_BATCHES, "unlimited"),
            (ENV_MAX_SUBMIT_ATTEMPTS, "unlimited"),
        ]))
        .unwrap();
        assert_eq!(config.simultaneous_batches, None);
        assert_eq!(config.max_submit_attempts, None);
    }

    #[test]
    fn invalid_values_are_reported_not_defaulted() {
        let err = RunConfig::from_lookup(lookup(&[(ENV_BATCH_SIZE, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: ENV_BATCH_SIZE,
                value: "lots".to_string()
            }
        );

        let err = RunConfig::from_lookup(lookup(&[(ENV_SIMULTANEOUS_BATCHES, "0")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: ENV_SIMULTANEOUS_BATCHES,
                ..
            }
        ));

        let config = RunConfig {
            batch_size: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn input_rows_keep_header_order_and_quoted_newlines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.csv");
        fs::write(
            &path,
            "recordId,companyName,city\n1,\"Acme\nHoldings\",Oslo\n2,Globex\n\n",
        )
        .await
        .unwrap();

        let rows = load_input_rows(&path).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["companyName"], "Acme\nHoldings");
        assert_eq!(rows[0]["city"], "Oslo");
        assert_eq!(rows[1]["companyName"], "Globex");
        assert!(!rows[1].contains_key("city"));
    }

    #[tokio::test]
    async fn match_params_load_from_yaml_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        fs::write(&path, "matchThreshold: 7\nmatchInputs: ignored\n")
            .await
            .unwrap();
        let config = RunConfig {
            match_params_file: Some(path),
            ..RunConfig::default()
        };
        let params = config.load_match_params().await.unwrap();
        assert_eq!(params["matchThreshold"], 7);

        let empty = RunConfig::default().load_match_params().await.unwrap();
        assert!(empty.is_empty());
    }
}
