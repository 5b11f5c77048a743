//! Wallet health summary
//!
//! Score is the share of live approvals the rule engine would leave alone.

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::indexer::WalletSnapshot;
use crate::rules::{evaluate, RevokeReason, RuleSet};

/// Health of one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WalletHealth {
    /// The indexer has no data for this wallet; distinct from "no approvals"
    NeverIndexed,
    Indexed(HealthSummary),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub wallet: Address,
    pub active_approvals: usize,
    pub flagged_approvals: usize,
    pub unlimited: usize,
    pub risky: usize,
    pub stale: usize,
    /// 0-100, higher is healthier
    pub score: u8,
    pub indexed_at: DateTime<Utc>,
}

/// Assess a wallet from its latest snapshot
pub fn assess(snapshot: Option<&WalletSnapshot>, rules: &RuleSet, now: DateTime<Utc>) -> WalletHealth {
    let Some(snapshot) = snapshot else {
        return WalletHealth::NeverIndexed;
    };

    let active_approvals = snapshot.approvals.iter().filter(|a| a.is_live()).count();
    let (mut unlimited, mut risky, mut stale) = (0, 0, 0);
    for action in snapshot
        .approvals
        .iter()
        .filter_map(|a| evaluate(a, rules, now))
    {
        match action.reason {
            RevokeReason::UnlimitedApproval => unlimited += 1,
            RevokeReason::RiskySpender => risky += 1,
            RevokeReason::StaleUnused => stale += 1,
        }
    }
    let flagged_approvals = unlimited + risky + stale;

    WalletHealth::Indexed(HealthSummary {
        wallet: snapshot.wallet,
        active_approvals,
        flagged_approvals,
        unlimited,
        risky,
        stale,
        score: score(active_approvals, flagged_approvals),
        indexed_at: snapshot.indexed_at,
    })
}

fn score(active: usize, flagged: usize) -> u8 {
    if active == 0 {
        return 100;
    }
    let healthy = active.saturating_sub(flagged) as f64;
    (100.0 * healthy / active as f64).round() as u8
}
