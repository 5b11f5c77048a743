//! Request and response bodies for the HTTP API

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delegation::{ActionKind, Delegation, DelegationStatus, Scope, ScopeLimits};
use crate::executor::{ExecutionRecord, ExecutionStatus};
use crate::indexer::{ApprovalObservation, ApprovalStatus};
use crate::rules::RevokeReason;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDelegationBody {
    pub delegator: Address,
    /// Defaults to the agent's own identity
    #[serde(default)]
    pub delegate: Option<Address>,
    pub scope: ScopeBody,
    pub grant_proof: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeBody {
    pub targets: Vec<Address>,
    pub actions: Vec<ActionKind>,
    #[serde(default)]
    pub max_actions_per_cycle: Option<u32>,
    #[serde(default)]
    pub max_fee_per_gas_wei: Option<u128>,
}

impl From<ScopeBody> for Scope {
    fn from(body: ScopeBody) -> Self {
        let defaults = ScopeLimits::default();
        Scope {
            targets: body.targets,
            actions: body.actions,
            limits: ScopeLimits {
                max_actions_per_cycle: body
                    .max_actions_per_cycle
                    .unwrap_or(defaults.max_actions_per_cycle),
                max_fee_per_gas_wei: body.max_fee_per_gas_wei,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDelegationResponse {
    pub delegation_id: String,
}

/// A delegation as shown to clients; the grant proof stays server-side
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationView {
    pub id: String,
    pub delegator: Address,
    pub delegate: Address,
    pub targets: Vec<Address>,
    pub actions: Vec<ActionKind>,
    pub max_actions_per_cycle: u32,
    pub max_fee_per_gas_wei: Option<u128>,
    pub status: DelegationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Delegation> for DelegationView {
    fn from(d: Delegation) -> Self {
        Self {
            id: d.id.to_string(),
            delegator: d.delegator,
            delegate: d.delegate,
            targets: d.scope.targets,
            actions: d.scope.actions,
            max_actions_per_cycle: d.scope.limits.max_actions_per_cycle,
            max_fee_per_gas_wei: d.scope.limits.max_fee_per_gas_wei,
            status: d.status,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ApprovalsQuery {
    #[serde(default)]
    pub risky_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalView {
    pub token: Address,
    pub spender: Address,
    /// Decimal string; uint256 does not fit a JSON number
    pub amount: String,
    pub is_unlimited: bool,
    pub is_risky: bool,
    pub status: ApprovalStatus,
    pub granted_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Why the agent would revoke this approval, if it would
    pub flagged_reason: Option<RevokeReason>,
}

impl ApprovalView {
    pub fn new(approval: &ApprovalObservation, flagged_reason: Option<RevokeReason>) -> Self {
        Self {
            token: approval.token,
            spender: approval.spender,
            amount: approval.amount.to_string(),
            is_unlimited: approval.is_unlimited,
            is_risky: approval.is_risky,
            status: approval.status,
            granted_at: approval.granted_at,
            last_used_at: approval.last_used_at,
            flagged_reason,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalsResponse {
    pub wallet: Address,
    pub indexed_at: DateTime<Utc>,
    pub approvals: Vec<ApprovalView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionsQuery {
    #[serde(default)]
    pub delegation_id: Option<String>,
}

/// Audit view of an execution record
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecordView {
    pub idempotency_key: String,
    pub delegation_id: String,
    pub kind: ActionKind,
    pub owner: Address,
    pub token: Address,
    pub spender: Address,
    pub reason: RevokeReason,
    pub status: ExecutionStatus,
    pub attempt_count: u32,
    pub tx_ref: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl From<ExecutionRecord> for ActionRecordView {
    fn from(r: ExecutionRecord) -> Self {
        Self {
            idempotency_key: r.idempotency_key.to_string(),
            delegation_id: r.delegation_id.to_string(),
            kind: r.action.kind,
            owner: r.action.owner,
            token: r.action.token,
            spender: r.action.spender,
            reason: r.action.reason,
            status: r.status,
            attempt_count: r.attempt_count,
            tx_ref: r.tx_ref,
            last_error: r.last_error,
            created_at: r.created_at,
            updated_at: r.updated_at,
            next_attempt_at: r.next_attempt_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
