//! Downstream delivery boundary.
//!
//! The gateway core never inspects HTTP details; it sees a `DeliveryClient`
//! that either returns the downstream record ID or a `DeliveryFailure`
//! already classified as retryable or permanent.

use crate::error::{OutboxError, OutboxResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// One write handed to the downstream memory store.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRequest {
    pub target_space: String,
    pub payload: String,
    pub payload_sha: String,
}

/// A delivery failure with its retryability decided at the client.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub retryable: bool,
    pub status_code: Option<u16>,
    pub message: String,
}

impl DeliveryFailure {
    /// A failure worth retrying later (connection refused, timeout, 5xx).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            status_code: None,
            message: message.into(),
        }
    }

    /// A failure that will not succeed on retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            status_code: None,
            message: message.into(),
        }
    }

    /// Classify an HTTP status: 5xx is retryable, 4xx is not.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            retryable: status >= 500,
            status_code: Some(status),
            message: message.into(),
        }
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "http {}: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Client for the downstream memory store.
pub trait DeliveryClient: Send + Sync {
    /// Deliver one write, returning the downstream record ID.
    fn deliver(
        &self,
        request: &DeliveryRequest,
    ) -> impl Future<Output = Result<String, DeliveryFailure>> + Send;
}

impl<D: DeliveryClient> DeliveryClient for Arc<D> {
    fn deliver(
        &self,
        request: &DeliveryRequest,
    ) -> impl Future<Output = Result<String, DeliveryFailure>> + Send {
        (**self).deliver(request)
    }
}

/// Configuration for the HTTP delivery client.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Base URL of the downstream memory store.
    pub base_url: String,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            timeout_secs: 30,
        }
    }
}

/// HTTP implementation of `DeliveryClient`.
pub struct HttpDeliveryClient {
    config: DeliveryConfig,
    client: reqwest::Client,
}

impl HttpDeliveryClient {
    pub fn new(config: DeliveryConfig) -> OutboxResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(OutboxError::Config(
                "delivery base_url must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }
}

#[derive(Debug, Deserialize)]
struct DeliveryResponse {
    id: String,
}

impl DeliveryClient for HttpDeliveryClient {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<String, DeliveryFailure> {
        let url = format!(
            "{}/spaces/{}/records",
            self.config.base_url.trim_end_matches('/'),
            request.target_space
        );

        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.config.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            // Connection-level failures never reached the store
            Err(e) => return Err(DeliveryFailure::retryable(format!("request failed: {e}"))),
        };

        let status = response.status();
        if status.is_success() {
            let body: DeliveryResponse = response
                .json()
                .await
                .map_err(|e| DeliveryFailure::retryable(format!("invalid response body: {e}")))?;
            return Ok(body.id);
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryFailure::from_status(status.as_u16(), truncate(&body, 200)))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
