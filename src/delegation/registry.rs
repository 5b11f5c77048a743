//! Delegation registry - authoritative store of granted authority
//!
//! All state sits behind one `RwLock`. A transition is applied to a copy of
//! the state, persisted, and only then swapped in, all under the write guard.
//! A reader never sees a half-applied transition, a revoke that returned
//! before `list_active` was called is always reflected in its snapshot, and a
//! transition whose save failed is not visible at all.

use alloy_primitives::Address;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::types::{Delegation, DelegationId, DelegationStatus, RegistrationRequest};

#[derive(Debug, Clone, Default)]
struct RegistryState {
    by_id: HashMap<DelegationId, Delegation>,
    /// (delegator, delegate) -> current delegation
    by_pair: HashMap<(Address, Address), DelegationId>,
}

impl RegistryState {
    fn insert(&mut self, delegation: Delegation) {
        self.by_pair.insert(
            (delegation.delegator, delegation.delegate),
            delegation.id.clone(),
        );
        self.by_id.insert(delegation.id.clone(), delegation);
    }

    fn lookup(&self, id: &DelegationId) -> Result<&Delegation> {
        self.by_id
            .get(id)
            .ok_or_else(|| Error::DelegationNotFound(id.to_string()))
    }

    /// Oldest first
    fn sorted(&self) -> Vec<Delegation> {
        let mut all: Vec<Delegation> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }
}

/// Delegation registry
pub struct DelegationRegistry {
    state: Arc<RwLock<RegistryState>>,
    persistence_path: Option<String>,
    save_lock: Mutex<()>,
}

impl DelegationRegistry {
    /// Create a new registry
    pub fn new(persistence_path: Option<String>) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            persistence_path,
            save_lock: Mutex::new(()),
        }
    }

    /// Register a grant, returning its id
    ///
    /// Re-registering a (delegator, delegate) pair that is active or paused
    /// replaces its scope and reactivates it under the same id. A pair whose
    /// last delegation was revoked gets a fresh id.
    pub async fn register(&self, request: RegistrationRequest) -> Result<DelegationId> {
        request.validate().map_err(Error::Validation)?;

        let now = Utc::now();
        let key = (request.delegator, request.delegate);

        let mut state = self.state.write().await;
        let mut next = state.clone();

        let existing = next
            .by_pair
            .get(&key)
            .cloned()
            .filter(|id| {
                next.by_id
                    .get(id)
                    .is_some_and(|d| d.status != DelegationStatus::Revoked)
            })
            .and_then(|id| next.by_id.get_mut(&id));

        let (id, updated) = match existing {
            Some(delegation) => {
                delegation.scope = request.scope;
                delegation.grant_proof = request.grant_proof;
                delegation.status = DelegationStatus::Active;
                delegation.updated_at = now;
                (delegation.id.clone(), true)
            }
            None => {
                let delegation = Delegation {
                    id: DelegationId::generate(),
                    delegator: request.delegator,
                    delegate: request.delegate,
                    scope: request.scope,
                    grant_proof: request.grant_proof,
                    status: DelegationStatus::Active,
                    created_at: now,
                    updated_at: now,
                };
                let id = delegation.id.clone();
                next.insert(delegation);
                (id, false)
            }
        };

        self.persist(&next).await?;
        *state = next;

        if updated {
            info!(delegation = %id, delegator = %key.0, "Updated existing delegation");
        } else {
            info!(delegation = %id, delegator = %key.0, "Registered delegation");
        }
        Ok(id)
    }

    /// Revoke a delegation. Revoking twice is not an error.
    pub async fn revoke(&self, id: &DelegationId) -> Result<Delegation> {
        let mut state = self.state.write().await;
        let current = state.lookup(id)?;

        if current.status == DelegationStatus::Revoked {
            debug!(delegation = %id, "Delegation already revoked");
            return Ok(current.clone());
        }

        let delegation = self
            .commit(&mut state, id, DelegationStatus::Revoked)
            .await?;
        info!(delegation = %id, "Revoked delegation");
        Ok(delegation)
    }

    /// Pause a delegation. Pausing a paused delegation is a no-op.
    pub async fn pause(&self, id: &DelegationId) -> Result<Delegation> {
        self.transition(id, DelegationStatus::Paused).await
    }

    /// Resume a paused delegation. Resuming an active delegation is a no-op.
    pub async fn resume(&self, id: &DelegationId) -> Result<Delegation> {
        self.transition(id, DelegationStatus::Active).await
    }

    async fn transition(&self, id: &DelegationId, target: DelegationStatus) -> Result<Delegation> {
        let mut state = self.state.write().await;
        let current = state.lookup(id)?;

        if current.status == DelegationStatus::Revoked {
            return Err(Error::DelegationInactive {
                id: id.to_string(),
                status: DelegationStatus::Revoked.to_string(),
            });
        }
        if current.status == target {
            return Ok(current.clone());
        }

        let delegation = self.commit(&mut state, id, target).await?;
        info!(delegation = %id, status = %target, "Delegation status changed");
        Ok(delegation)
    }

    /// Persist a status change, then apply it. Caller holds the write guard.
    async fn commit(
        &self,
        state: &mut RegistryState,
        id: &DelegationId,
        status: DelegationStatus,
    ) -> Result<Delegation> {
        let mut next = state.clone();
        let delegation = next
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::DelegationNotFound(id.to_string()))?;
        delegation.status = status;
        delegation.updated_at = Utc::now();
        let delegation = delegation.clone();

        self.persist(&next).await?;
        *state = next;
        Ok(delegation)
    }

    /// Snapshot of active delegations held by `delegate`, oldest first
    pub async fn list_active(&self, delegate: &Address) -> Vec<Delegation> {
        let state = self.state.read().await;
        let mut active: Vec<Delegation> = state
            .by_id
            .values()
            .filter(|d| d.is_active() && d.delegate == *delegate)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        active
    }

    /// Current state of a single delegation
    pub async fn get(&self, id: &DelegationId) -> Option<Delegation> {
        self.state.read().await.by_id.get(id).cloned()
    }

    /// Every delegation, including revoked ones
    pub async fn list_all(&self) -> Vec<Delegation> {
        self.state.read().await.sorted()
    }

    /// Load delegations from disk
    pub async fn load(&self) -> Result<()> {
        if let Some(path) = &self.persistence_path {
            if Path::new(path).exists() {
                let data = tokio::fs::read_to_string(path).await?;
                let mut delegations: Vec<Delegation> = serde_json::from_str(&data)?;
                // Oldest first so the pair index ends on the latest grant
                delegations.sort_by(|a, b| a.created_at.cmp(&b.created_at));

                let mut state = self.state.write().await;
                *state = RegistryState::default();
                for delegation in delegations {
                    state.insert(delegation);
                }

                info!("Loaded {} delegations from {}", state.by_id.len(), path);
            }
        }
        Ok(())
    }

    /// Save delegations to disk
    pub async fn save(&self) -> Result<()> {
        let state = self.state.read().await;
        self.persist(&state).await
    }

    async fn persist(&self, state: &RegistryState) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        let delegations = state.sorted();
        let data = serde_json::to_string_pretty(&delegations)?;

        // Write-then-rename so a crash never leaves a torn file
        let tmp = format!("{}.tmp", path);
        let written = match tokio::fs::write(&tmp, data).await {
            Ok(()) => tokio::fs::rename(&tmp, path).await,
            Err(e) => Err(e),
        };
        written.map_err(|e| {
            warn!("Failed to persist delegations to {}: {}", path, e);
            Error::Persistence(e.to_string())
        })?;

        debug!("Saved {} delegations to {}", delegations.len(), path);
        Ok(())
    }
}
