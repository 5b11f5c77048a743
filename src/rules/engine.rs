//! Rule evaluation
//!
//! Pure mapping from observed approvals to proposed actions. First match wins
//! per approval, in this order:
//!
//! 1. amount at or above the unlimited threshold (or flagged unlimited)
//! 2. risky spender
//! 3. older than the staleness threshold with no recent use
//!
//! Nothing here touches the network or the clock; `now` is an argument.

use alloy_primitives::{hex, Address, U256};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::{window_days, RulesConfig};
use crate::delegation::{ActionKind, DelegationId};
use crate::indexer::ApprovalObservation;

use super::policy::{FlaggedSpenderPolicy, LastUseWindow, RiskPolicy, UsagePolicy};

/// Why an action was proposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    UnlimitedApproval,
    RiskySpender,
    StaleUnused,
}

impl RevokeReason {
    /// Rule precedence, lower fires first
    pub fn precedence(&self) -> u8 {
        match self {
            RevokeReason::UnlimitedApproval => 0,
            RevokeReason::RiskySpender => 1,
            RevokeReason::StaleUnused => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RevokeReason::UnlimitedApproval => "unlimited approval",
            RevokeReason::RiskySpender => "risky spender",
            RevokeReason::StaleUnused => "stale/unused",
        }
    }
}

impl std::fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic identifier for "this action under this delegation"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub String);

impl IdempotencyKey {
    /// hex(sha256(delegation | token | spender | reason))
    pub fn derive(
        delegation_id: &DelegationId,
        token: &Address,
        spender: &Address,
        reason: RevokeReason,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(delegation_id.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(token.as_slice());
        hasher.update(b"|");
        hasher.update(spender.as_slice());
        hasher.update(b"|");
        hasher.update(reason.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An action the engine wants executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub kind: ActionKind,
    pub owner: Address,
    pub token: Address,
    pub spender: Address,
    pub reason: RevokeReason,
}

impl ProposedAction {
    pub fn idempotency_key(&self, delegation_id: &DelegationId) -> IdempotencyKey {
        IdempotencyKey::derive(delegation_id, &self.token, &self.spender, self.reason)
    }

    /// Digest of the full payload, to catch a key reused for a different action
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update(self.owner.as_slice());
        hasher.update(self.token.as_slice());
        hasher.update(self.spender.as_slice());
        hasher.update(self.reason.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Thresholds and policies the engine evaluates against
#[derive(Clone)]
pub struct RuleSet {
    pub unlimited_threshold: U256,
    pub staleness_threshold: Duration,
    pub risk: Arc<dyn RiskPolicy>,
    pub usage: Arc<dyn UsagePolicy>,
}

impl RuleSet {
    pub fn new(
        unlimited_threshold: U256,
        staleness_threshold_days: u64,
        risk: Arc<dyn RiskPolicy>,
        usage: Arc<dyn UsagePolicy>,
    ) -> Self {
        Self {
            unlimited_threshold,
            staleness_threshold: window_days(staleness_threshold_days),
            risk,
            usage,
        }
    }

    /// Build the default policies from configuration
    pub fn from_config(config: &RulesConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.threshold_amount()?,
            config.staleness_threshold_days,
            Arc::new(FlaggedSpenderPolicy::new(config.risky_spenders.iter().copied())),
            Arc::new(LastUseWindow::days(config.usage_window_days)),
        ))
    }
}

/// Evaluate one approval
pub fn evaluate(
    approval: &ApprovalObservation,
    rules: &RuleSet,
    now: DateTime<Utc>,
) -> Option<ProposedAction> {
    if !approval.is_live() {
        return None;
    }

    let reason = if approval.is_unlimited || approval.amount >= rules.unlimited_threshold {
        RevokeReason::UnlimitedApproval
    } else if rules.risk.is_risky(approval) {
        RevokeReason::RiskySpender
    } else if approval.age(now) > rules.staleness_threshold
        && !rules.usage.recently_used(approval, now)
    {
        RevokeReason::StaleUnused
    } else {
        return None;
    };

    Some(ProposedAction {
        kind: ActionKind::Revoke,
        owner: approval.owner,
        token: approval.token,
        spender: approval.spender,
        reason,
    })
}

/// Evaluate every approval, keeping input order and dropping non-matches
pub fn evaluate_all(
    approvals: &[ApprovalObservation],
    rules: &RuleSet,
    now: DateTime<Utc>,
) -> Vec<ProposedAction> {
    approvals
        .iter()
        .filter_map(|approval| evaluate(approval, rules, now))
        .collect()
}
