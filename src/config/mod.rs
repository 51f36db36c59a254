use std::str::FromStr;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;

use crate::pipeline::orchestrator::{PipelineSettings, PipelineStep};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::runner::RunLimits;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AppConfig {
    /// PostgreSQL connection string
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Maximum Postgres connections in the pool
    #[serde(default = "default_db_max_connections")]
    #[garde(range(min = 1))]
    pub db_max_connections: u32,

    /// Bucket holding stored replays
    #[garde(length(min = 1))]
    pub s3_bucket: String,

    /// AWS region, or region label for custom endpoints
    #[serde(default = "default_s3_region")]
    #[garde(length(min = 1))]
    pub s3_region: String,

    /// Custom S3-compatible endpoint (R2, MinIO). Optional.
    #[serde(default)]
    #[garde(skip)]
    pub s3_endpoint: Option<String>,

    /// S3 access key ID
    #[garde(skip)]
    pub s3_access_key: String,

    /// S3 secret access key
    #[garde(skip)]
    pub s3_secret_key: String,

    /// Key prefix ("folder") replays are stored under
    #[serde(default = "default_storage_prefix")]
    #[garde(skip)]
    pub storage_prefix: String,

    /// Path to the deck classifier model (JSON)
    #[garde(length(min = 1))]
    pub classifier_model_path: String,

    /// Per-request timeout for replay fetches
    #[serde(default = "default_fetch_timeout_secs")]
    #[garde(range(min = 1))]
    pub fetch_timeout_secs: u64,

    /// Maximum fetch jobs in flight
    #[serde(default = "default_max_concurrent")]
    #[garde(range(min = 1))]
    pub max_concurrent: usize,

    /// Maximum fetch jobs started per second
    #[serde(default = "default_max_per_second")]
    #[garde(range(min = 1))]
    pub max_per_second: u32,

    /// Attempts per fetch job before it is marked failed
    #[serde(default = "default_max_attempts")]
    #[garde(range(min = 1))]
    pub max_attempts: u32,

    /// Backoff floor in milliseconds
    #[serde(default = "default_min_wait_ms")]
    #[garde(range(min = 1))]
    pub min_wait_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_wait_ms")]
    #[garde(custom(at_least(self.min_wait_ms)))]
    pub max_wait_ms: u64,

    /// Backoff growth factor per attempt
    #[serde(default = "default_backoff_multiplier")]
    #[garde(range(min = 1.0))]
    pub backoff_multiplier: f64,

    /// Number of classification worker threads
    #[serde(default = "default_worker_pool_size")]
    #[garde(range(min = 1))]
    pub worker_pool_size: usize,

    /// Comma-separated steps to run: fetch, reconcile, classify
    #[serde(default = "default_pipeline_steps")]
    #[garde(custom(valid_steps))]
    pub pipeline_steps: String,

    /// Move failed jobs back to pending before running
    #[serde(default)]
    #[garde(skip)]
    pub requeue_failed: bool,

    /// Release in-progress jobs idle for longer than this before running
    #[serde(default)]
    #[garde(skip)]
    pub reclaim_stale_after_secs: Option<u64>,

    /// Prometheus exporter listen address (e.g., "0.0.0.0:9000"). Optional.
    #[serde(default)]
    #[garde(skip)]
    pub metrics_addr: Option<String>,
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_storage_prefix() -> String {
    "replays/".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    30
}

fn default_max_per_second() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_wait_ms() -> u64 {
    2_000
}

fn default_max_wait_ms() -> u64 {
    16_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_pipeline_steps() -> String {
    "fetch,reconcile,classify".to_string()
}

fn at_least(min: u64) -> impl FnOnce(&u64, &()) -> garde::Result {
    move |value, _| {
        if *value >= min {
            Ok(())
        } else {
            Err(garde::Error::new(format!("must be at least {}", min)))
        }
    }
}

fn valid_steps(value: &str, _: &()) -> garde::Result {
    parse_steps(value).map(|_| ()).map_err(garde::Error::new)
}

fn parse_steps(value: &str) -> Result<Vec<PipelineStep>, String> {
    let steps = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| PipelineStep::from_str(s).map_err(|_| format!("unknown pipeline step '{}'", s)))
        .collect::<Result<Vec<_>, _>>()?;
    if steps.is_empty() {
        return Err("no pipeline steps configured".to_string());
    }
    Ok(steps)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.min_wait_ms),
            Duration::from_millis(self.max_wait_ms),
            self.backoff_multiplier,
        )
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retry: self.retry_policy(),
            limits: RunLimits::new(self.max_concurrent, self.max_per_second),
            worker_pool_size: self.worker_pool_size,
            storage_prefix: self.storage_prefix.clone(),
        }
    }

    pub fn steps(&self) -> Result<Vec<PipelineStep>, ConfigError> {
        parse_steps(&self.pipeline_steps).map_err(ConfigError::Steps)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),

    #[error("Invalid pipeline steps: {0}")]
    Steps(String),
}
