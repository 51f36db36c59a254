//! Remote replay source.
//!
//! Fetches replay payloads by locator (the replay URL recorded on the job).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::error::Transience;

/// Source the fetch stage pulls raw replay payloads from.
#[async_trait]
pub trait ReplaySource: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError>;
}

/// HTTP replay source.
pub struct HttpReplaySource {
    http: Client,
}

impl HttpReplaySource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent("replay-pipeline/0.1")
            .timeout(timeout)
            .build()?;

        Ok(Self { http })
    }
}

#[async_trait]
impl ReplaySource for HttpReplaySource {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http
            .get(locator)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                locator: locator.to_string(),
                status,
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(FetchError::Empty(locator.to_string()));
        }

        Ok(body.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Replay source returned {status} for {locator}")]
    Status { locator: String, status: StatusCode },

    #[error("Replay source returned an empty body for {0}")]
    Empty(String),

    #[error("Replay not available: {0}")]
    Unavailable(String),

    #[error("Replay rejected: {0}")]
    Rejected(String),
}

impl Transience for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            FetchError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error()
            }
            // Replay pages occasionally serve an empty document while loading.
            FetchError::Empty(_) => true,
            FetchError::Unavailable(_) => true,
            FetchError::Rejected(_) => false,
        }
    }
}
