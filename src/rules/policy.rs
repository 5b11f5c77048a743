//! Pluggable heuristics behind the risky and stale rules
//!
//! Both are pure predicates over an observation. Which spenders count as risky
//! and what counts as recent use is a deployment decision, so the engine only
//! depends on these traits.

use alloy_primitives::Address;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::config::window_days;
use crate::indexer::ApprovalObservation;

/// Decides whether an approval's spender is risky
pub trait RiskPolicy: Send + Sync {
    fn is_risky(&self, approval: &ApprovalObservation) -> bool;
}

/// Decides whether an approval has been used recently
pub trait UsagePolicy: Send + Sync {
    fn recently_used(&self, approval: &ApprovalObservation, now: DateTime<Utc>) -> bool;
}

/// Trusts the indexer's flag, plus a local spender denylist
#[derive(Debug, Clone, Default)]
pub struct FlaggedSpenderPolicy {
    denylist: HashSet<Address>,
}

impl FlaggedSpenderPolicy {
    pub fn new(denylist: impl IntoIterator<Item = Address>) -> Self {
        Self {
            denylist: denylist.into_iter().collect(),
        }
    }
}

impl RiskPolicy for FlaggedSpenderPolicy {
    fn is_risky(&self, approval: &ApprovalObservation) -> bool {
        approval.is_risky || self.denylist.contains(&approval.spender)
    }
}

/// Recent use means a spend inside a trailing window
#[derive(Debug, Clone)]
pub struct LastUseWindow {
    window: Duration,
}

impl LastUseWindow {
    pub fn days(days: u64) -> Self {
        Self {
            window: window_days(days),
        }
    }
}

impl UsagePolicy for LastUseWindow {
    fn recently_used(&self, approval: &ApprovalObservation, now: DateTime<Utc>) -> bool {
        approval
            .last_used_at
            .is_some_and(|used| now - used <= self.window)
    }
}
