//! Callback transport.

use super::pool::CallbackJob;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Why a delivery attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying: timeouts, connection failures, 5xx.
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Retrying cannot help: 4xx, malformed URL.
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Delivers one completion callback.
#[async_trait]
pub trait CallbackClient: Send + Sync {
    async fn deliver(&self, job: &CallbackJob) -> Result<(), DeliveryError>;
}

/// JSON-over-HTTP callback client.
pub struct HttpCallbackClient {
    http: reqwest::Client,
}

impl HttpCallbackClient {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {}", e))?;
        Ok(Self { http })
    }

    fn classify(err: &reqwest::Error) -> DeliveryError {
        if err.is_timeout() || err.is_connect() {
            DeliveryError::Transient(err.to_string())
        } else if err.is_builder() {
            DeliveryError::Permanent(err.to_string())
        } else {
            DeliveryError::Transient(err.to_string())
        }
    }
}

#[async_trait]
impl CallbackClient for HttpCallbackClient {
    async fn deliver(&self, job: &CallbackJob) -> Result<(), DeliveryError> {
        let url = url::Url::parse(&job.url)
            .map_err(|e| DeliveryError::Permanent(format!("invalid callback url {}: {e}", job.url)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(DeliveryError::Permanent(format!(
                "unsupported callback scheme: {}",
                url.scheme()
            )));
        }

        let response = self
            .http
            .post(url)
            .json(&job.payload)
            .send()
            .await
            .map_err(|e| Self::classify(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(DeliveryError::Transient(format!("callback returned {}", status)))
        } else {
            Err(DeliveryError::Permanent(format!("callback returned {}", status)))
        }
    }
}
