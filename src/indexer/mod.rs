//! Read-only view of on-chain approvals
//!
//! The indexer is an external collaborator. Its data lags chain head, so every
//! snapshot carries the time it was indexed and callers decide how much lag
//! they tolerate.

pub mod http;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use http::HttpIndexer;

/// On-chain state of an allowance as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Active,
    Revoked,
}

/// One allowance as reported by the indexer
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalObservation {
    /// Wallet that granted the allowance
    pub owner: Address,
    /// Contract allowed to move the tokens
    pub spender: Address,
    /// Token contract
    pub token: Address,
    pub amount: U256,
    /// Indexer's own unlimited flag
    pub is_unlimited: bool,
    /// Indexer's risk flag for the spender
    pub is_risky: bool,
    pub observed_at: DateTime<Utc>,
    /// When the allowance was granted, if known
    pub granted_at: Option<DateTime<Utc>>,
    /// Most recent spend through this allowance, if known
    pub last_used_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
}

impl ApprovalObservation {
    /// Whether the allowance still grants anything
    pub fn is_live(&self) -> bool {
        self.status == ApprovalStatus::Active && !self.amount.is_zero()
    }

    /// Age of the allowance; falls back to observation time when the grant
    /// time is unknown
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.granted_at.unwrap_or(self.observed_at)
    }
}

/// Everything one indexer read returns for a wallet
#[derive(Debug, Clone)]
pub struct WalletSnapshot {
    pub wallet: Address,
    pub approvals: Vec<ApprovalObservation>,
    /// Current gas price reported alongside the approvals
    pub gas_price_wei: Option<u128>,
    pub indexed_at: DateTime<Utc>,
}

impl WalletSnapshot {
    /// Whether a live allowance for (token, spender) is present
    pub fn holds_live(&self, token: &Address, spender: &Address) -> bool {
        self.approvals
            .iter()
            .any(|a| a.token == *token && a.spender == *spender && a.is_live())
    }

    /// How far the snapshot trails `now`
    pub fn lag(&self, now: DateTime<Utc>) -> Duration {
        now - self.indexed_at
    }
}

/// Source of approval state
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Current approvals for `wallet`; `None` when the wallet was never indexed
    async fn wallet_snapshot(&self, wallet: &Address) -> Result<Option<WalletSnapshot>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(amount: u64, status: ApprovalStatus) -> ApprovalObservation {
        ApprovalObservation {
            owner: Address::repeat_byte(0x01),
            spender: Address::repeat_byte(0x02),
            token: Address::repeat_byte(0x03),
            amount: U256::from(amount),
            is_unlimited: false,
            is_risky: false,
            observed_at: Utc::now(),
            granted_at: None,
            last_used_at: None,
            status,
        }
    }

    #[test]
    fn test_live_requires_active_and_nonzero() {
        assert!(observation(5, ApprovalStatus::Active).is_live());
        assert!(!observation(0, ApprovalStatus::Active).is_live());
        assert!(!observation(5, ApprovalStatus::Revoked).is_live());
    }

    #[test]
    fn test_age_prefers_grant_time() {
        let now = Utc::now();
        let mut approval = observation(5, ApprovalStatus::Active);
        approval.observed_at = now;
        assert_eq!(approval.age(now), Duration::zero());

        approval.granted_at = Some(now - Duration::days(40));
        assert_eq!(approval.age(now).num_days(), 40);
    }

    #[test]
    fn test_holds_live() {
        let snapshot = WalletSnapshot {
            wallet: Address::repeat_byte(0x01),
            approvals: vec![
                observation(5, ApprovalStatus::Active),
                ApprovalObservation {
                    token: Address::repeat_byte(0x04),
                    ..observation(0, ApprovalStatus::Active)
                },
            ],
            gas_price_wei: None,
            indexed_at: Utc::now(),
        };
        assert!(snapshot.holds_live(&Address::repeat_byte(0x03), &Address::repeat_byte(0x02)));
        assert!(!snapshot.holds_live(&Address::repeat_byte(0x04), &Address::repeat_byte(0x02)));
    }
}
