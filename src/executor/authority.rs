//! Authority provider client
//!
//! The authority provider holds the delegated signing capability. We hand it
//! a delegation, its opaque grant proof and an unsigned transaction; it either
//! returns a transaction reference or a structured rejection.

use alloy_primitives::Address;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::AuthorityConfig;
use crate::delegation::DelegationId;
use crate::error::{Error, Result};
use crate::rules::IdempotencyKey;

use super::intent::TxIntent;

/// Why the authority provider refused a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Rejection {
    #[error("insufficient scope: {0}")]
    InsufficientScope(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("rejected on-chain: {0}")]
    RejectedOnChain(String),
}

/// Reference to a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl TxRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TxRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the provider needs to act under a delegation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    pub delegation_id: DelegationId,
    pub delegator: Address,
    pub delegate: Address,
    pub grant_proof: String,
    pub idempotency_key: IdempotencyKey,
    pub intent: TxIntent,
}

/// Submits transactions under delegated authority
#[async_trait]
pub trait AuthorityProvider: Send + Sync {
    async fn submit(&self, request: &SubmissionRequest) -> Result<TxRef>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(default)]
    tx_ref: Option<String>,
    #[serde(default)]
    rejection: Option<Rejection>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP authority provider client
pub struct HttpAuthority {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpAuthority {
    pub fn new(config: &AuthorityConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        let api_key = if config.api_key.is_empty() {
            None
        } else {
            Some(config.api_key.clone())
        };

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            timeout,
        })
    }

    /// Check the provider answers at all
    pub async fn health_check(&self) -> Result<Duration> {
        let start = std::time::Instant::now();
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?
            .error_for_status()
            .map_err(|e| Error::AuthorityUnavailable(e.to_string()))?;
        Ok(start.elapsed())
    }

    fn map_transport(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::AuthorityTimeout(self.timeout.as_millis() as u64)
        } else {
            Error::AuthorityUnavailable(format!("Authority request failed: {}", e))
        }
    }
}

#[async_trait]
impl AuthorityProvider for HttpAuthority {
    async fn submit(&self, request: &SubmissionRequest) -> Result<TxRef> {
        debug!(
            delegation = %request.delegation_id,
            key = %request.idempotency_key,
            "Submitting to authority provider"
        );

        let mut builder = self
            .client
            .post(format!("{}/submissions", self.base_url))
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_transport(e))?;

        let result = interpret_response(status, body);
        if let Err(Error::AuthorityRejected(rejection)) = &result {
            info!(key = %request.idempotency_key, "Submission rejected: {}", rejection);
        }
        result
    }
}

/// Map a provider response onto a reference or a classified error
///
/// 429 and 5xx are transient. Other 4xx responses are permanent: retrying the
/// same request cannot change the answer.
fn interpret_response(status: StatusCode, body: String) -> Result<TxRef> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::AuthorityUnavailable(format!(
            "Authority error {}: {}",
            status, body
        )));
    }

    let parsed: Option<SubmitResponse> = serde_json::from_str(&body).ok();

    if let Some(rejection) = parsed.as_ref().and_then(|r| r.rejection.clone()) {
        return Err(Error::AuthorityRejected(rejection));
    }

    if !status.is_success() {
        let detail = parsed.and_then(|r| r.error).unwrap_or(body);
        let message = format!("Authority returned {}: {}", status, detail);
        return Err(if status.is_client_error() {
            Error::AuthorityRefused(message)
        } else {
            Error::AuthorityUnavailable(message)
        });
    }

    parsed
        .and_then(|r| r.tx_ref)
        .filter(|tx| !tx.is_empty())
        .map(TxRef)
        .ok_or_else(|| {
            Error::AuthorityUnavailable("No transaction reference in response".to_string())
        })
}
