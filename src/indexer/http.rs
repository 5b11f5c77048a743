//! HTTP indexer client
//!
//! Talks to an approvals indexer exposing
//! `GET {endpoint}/wallets/{address}/approvals`. A 404 means the wallet has
//! never been indexed, which is different from an empty approval list.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::config::IndexerConfig;
use crate::error::{Error, Result};

use super::{ApprovalObservation, ApprovalStatus, Indexer, WalletSnapshot};

/// Indexer client
pub struct HttpIndexer {
    /// HTTP client
    client: Client,
    /// Base URL, no trailing slash
    base_url: String,
    /// Request timeout
    timeout: Duration,
}

impl HttpIndexer {
    /// Create a new indexer client
    pub fn new(config: &IndexerConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Check the indexer answers at all
    pub async fn health_check(&self) -> Result<Duration> {
        let start = std::time::Instant::now();
        self.client
            .get(format!("{}/health", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?
            .error_for_status()
            .map_err(|e| Error::Indexer(e.to_string()))?;
        Ok(start.elapsed())
    }

    fn map_transport(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::IndexerTimeout(self.timeout.as_millis() as u64)
        } else {
            Error::Indexer(format!("Indexer request failed: {}", e))
        }
    }
}

#[async_trait]
impl Indexer for HttpIndexer {
    async fn wallet_snapshot(&self, wallet: &Address) -> Result<Option<WalletSnapshot>> {
        let url = format!("{}/wallets/{}/approvals", self.base_url, wallet);

        debug!("Fetching approvals for {}", wallet);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Indexer(format!("Indexer error {}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::IndexerMalformed(format!(
                "Indexer rejected request {}: {}",
                status, body
            )));
        }

        let wire: WireSnapshot = response
            .json()
            .await
            .map_err(|e| Error::IndexerMalformed(format!("Failed to parse indexer response: {}", e)))?;

        wire.into_snapshot().map(Some)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSnapshot {
    wallet: String,
    indexed_at: DateTime<Utc>,
    #[serde(default)]
    gas_price_wei: Option<String>,
    #[serde(default)]
    approvals: Vec<WireApproval>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireApproval {
    owner: String,
    spender: String,
    token: String,
    /// Decimal or 0x-hex
    amount: String,
    #[serde(default)]
    is_unlimited: bool,
    #[serde(default)]
    is_risky: bool,
    #[serde(default)]
    granted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_used_at: Option<DateTime<Utc>>,
    #[serde(default = "default_status")]
    status: ApprovalStatus,
}

fn default_status() -> ApprovalStatus {
    ApprovalStatus::Active
}

impl WireSnapshot {
    fn into_snapshot(self) -> Result<WalletSnapshot> {
        let wallet = parse_address(&self.wallet, "wallet")?;
        let gas_price_wei = match self.gas_price_wei {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u128>()
                    .map_err(|e| Error::IndexerMalformed(format!("gasPriceWei: {}", e)))?,
            ),
            None => None,
        };

        let indexed_at = self.indexed_at;
        let approvals = self
            .approvals
            .into_iter()
            .map(|a| a.into_observation(indexed_at))
            .collect::<Result<Vec<_>>>()?;

        Ok(WalletSnapshot {
            wallet,
            approvals,
            gas_price_wei,
            indexed_at,
        })
    }
}

impl WireApproval {
    fn into_observation(self, observed_at: DateTime<Utc>) -> Result<ApprovalObservation> {
        let amount = U256::from_str(self.amount.trim())
            .map_err(|e| Error::IndexerMalformed(format!("amount {:?}: {}", self.amount, e)))?;

        Ok(ApprovalObservation {
            owner: parse_address(&self.owner, "owner")?,
            spender: parse_address(&self.spender, "spender")?,
            token: parse_address(&self.token, "token")?,
            amount,
            is_unlimited: self.is_unlimited,
            is_risky: self.is_risky,
            observed_at,
            granted_at: self.granted_at,
            last_used_at: self.last_used_at,
            status: self.status,
        })
    }
}

fn parse_address(raw: &str, field: &str) -> Result<Address> {
    Address::from_str(raw.trim())
        .map_err(|e| Error::IndexerMalformed(format!("{} {:?}: {}", field, raw, e)))
}
