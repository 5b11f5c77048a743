//! Execution records - durable intent and audit trail for submitted actions

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::delegation::DelegationId;
use crate::rules::{IdempotencyKey, ProposedAction};

/// State of one action's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Intent recorded; awaiting submission, retry or confirmation
    Pending,
    /// Observed resolved on-chain after our submission
    Confirmed,
    /// Rejected permanently
    Failed,
    /// Retry budget exhausted, needs review
    Abandoned,
    /// Resolved by some other path before we landed
    Superseded,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending)
    }

    /// Terminal states that an operator should look at
    pub fn needs_review(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Abandoned)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Confirmed => write!(f, "confirmed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Abandoned => write!(f, "abandoned"),
            ExecutionStatus::Superseded => write!(f, "superseded"),
        }
    }
}

/// One action's execution history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub idempotency_key: IdempotencyKey,
    pub delegation_id: DelegationId,
    pub action: ProposedAction,
    /// Digest of `action`, see `ProposedAction::fingerprint`
    pub fingerprint: String,
    pub status: ExecutionStatus,
    pub attempt_count: u32,
    pub tx_ref: Option<String>,
    pub last_error: Option<String>,
    /// Times this key was reopened after a terminal outcome
    #[serde(default)]
    pub generation: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// A worker currently owns this record; never persisted
    #[serde(skip)]
    pub in_flight: bool,
}

impl ExecutionRecord {
    /// New pending record, claimed by the caller
    pub fn pending(
        key: IdempotencyKey,
        delegation_id: DelegationId,
        action: ProposedAction,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            idempotency_key: key,
            delegation_id,
            fingerprint: action.fingerprint(),
            action,
            status: ExecutionStatus::Pending,
            attempt_count: 0,
            tx_ref: None,
            last_error: None,
            generation: 0,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            next_attempt_at: None,
            in_flight: true,
        }
    }

    pub fn awaiting_confirmation(&self) -> bool {
        self.status == ExecutionStatus::Pending && self.tx_ref.is_some()
    }
}

/// Bounded exponential backoff across cycles
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let scaled = self.base.num_seconds().saturating_mul(1i64 << exponent);
        Duration::seconds(scaled.min(self.max.num_seconds()))
    }

    pub fn exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}
