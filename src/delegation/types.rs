//! Core types for delegated authority
//!
//! Defines delegations, their scope, and registration requests.

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Registry-assigned delegation identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DelegationId(pub String);

impl DelegationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DelegationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DelegationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a delegation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Active,
    Paused,
    /// Terminal; the record is kept for audit
    Revoked,
}

impl std::fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DelegationStatus::Active => write!(f, "active"),
            DelegationStatus::Paused => write!(f, "paused"),
            DelegationStatus::Revoked => write!(f, "revoked"),
        }
    }
}

/// Kind of action a delegation may authorize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Zero out an allowance
    Revoke,
    /// Merge overlapping allowances
    Consolidate,
    /// Clear residual allowances
    Cleanup,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Revoke => write!(f, "revoke"),
            ActionKind::Consolidate => write!(f, "consolidate"),
            ActionKind::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Quantitative bounds on a delegation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLimits {
    /// Maximum submissions per evaluation cycle
    #[serde(default = "default_max_actions_per_cycle")]
    pub max_actions_per_cycle: u32,

    /// Fee ceiling granted by the delegator, in wei per gas
    #[serde(default)]
    pub max_fee_per_gas_wei: Option<u128>,
}

fn default_max_actions_per_cycle() -> u32 {
    10
}

impl Default for ScopeLimits {
    fn default() -> Self {
        Self {
            max_actions_per_cycle: default_max_actions_per_cycle(),
            max_fee_per_gas_wei: None,
        }
    }
}

/// What a delegation authorizes the agent to touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Token contracts the agent may call
    pub targets: Vec<Address>,

    /// Action kinds the agent may perform
    pub actions: Vec<ActionKind>,

    #[serde(default)]
    pub limits: ScopeLimits,
}

impl Scope {
    /// Check the scope is well formed
    pub fn validate(&self) -> Result<(), String> {
        if self.targets.is_empty() {
            return Err("scope must name at least one target".to_string());
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if *target == Address::ZERO {
                return Err("scope target cannot be the zero address".to_string());
            }
            if !seen.insert(*target) {
                return Err(format!("duplicate scope target {}", target));
            }
        }

        if self.actions.is_empty() {
            return Err("scope must authorize at least one action kind".to_string());
        }

        if self.limits.max_actions_per_cycle == 0 {
            return Err("max_actions_per_cycle must be positive".to_string());
        }

        if self.limits.max_fee_per_gas_wei == Some(0) {
            return Err("max_fee_per_gas_wei cannot be zero".to_string());
        }

        Ok(())
    }

    /// Whether an action of `kind` against `target` falls inside this scope
    pub fn permits(&self, kind: ActionKind, target: &Address) -> bool {
        self.actions.contains(&kind) && self.targets.contains(target)
    }

    /// Effective fee ceiling: the tighter of the agent's and the delegator's
    pub fn fee_ceiling(&self, agent_ceiling_wei: u128) -> u128 {
        match self.limits.max_fee_per_gas_wei {
            Some(limit) => limit.min(agent_ceiling_wei),
            None => agent_ceiling_wei,
        }
    }
}

/// A scoped, revocable grant of authority from a wallet to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,

    /// Wallet granting authority
    pub delegator: Address,

    /// Agent identity receiving authority
    pub delegate: Address,

    pub scope: Scope,

    /// Opaque proof forwarded to the authority provider
    pub grant_proof: String,

    pub status: DelegationStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Delegation {
    pub fn is_active(&self) -> bool {
        self.status == DelegationStatus::Active
    }
}

/// Incoming grant registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub delegator: Address,
    pub delegate: Address,
    pub scope: Scope,
    pub grant_proof: String,
}

impl RegistrationRequest {
    /// Validate the request before it reaches the registry
    pub fn validate(&self) -> Result<(), String> {
        if self.delegator == Address::ZERO {
            return Err("delegator is required".to_string());
        }
        if self.delegate == Address::ZERO {
            return Err("delegate is required".to_string());
        }
        if self.delegator == self.delegate {
            return Err("delegator and delegate must differ".to_string());
        }
        if self.grant_proof.trim().is_empty() {
            return Err("grant proof is required".to_string());
        }
        self.scope.validate()
    }
}
