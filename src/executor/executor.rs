//! Transaction executor
//!
//! Turns proposed actions into authority-bound submissions. For each action:
//! fresh scope check against the registry, fee ceiling check, atomic claim of
//! the idempotency key, durable pending record, then exactly one call to the
//! authority provider.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{window_secs, Config};
use crate::delegation::{Delegation, DelegationId, DelegationRegistry, DelegationStatus};
use crate::error::{Error, Result};
use crate::indexer::WalletSnapshot;
use crate::rules::{IdempotencyKey, ProposedAction};

use super::authority::{AuthorityProvider, SubmissionRequest, TxRef};
use super::intent::encode_intent;
use super::record::RetryPolicy;
use super::store::{Claim, ExecutionStore, FailureDisposition, ReconcileSummary, SkipReason};

const WEI_PER_GWEI: u128 = 1_000_000_000;

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Agent-wide fee ceiling in wei per gas
    pub fee_ceiling_wei: u128,
    /// Gas price assumed when the snapshot carries none
    pub fallback_gas_price_wei: u128,
    pub retry: RetryPolicy,
    pub confirmation_timeout: chrono::Duration,
    /// Resolved records younger than this are not reopened
    pub reopen_after: chrono::Duration,
    /// Timeout on a single authority provider call
    pub submit_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        let executor = &config.executor;
        Self {
            fee_ceiling_wei: executor.max_fee_per_gas_gwei as u128 * WEI_PER_GWEI,
            fallback_gas_price_wei: executor.fallback_gas_price_gwei as u128 * WEI_PER_GWEI,
            retry: RetryPolicy {
                max_attempts: executor.max_attempts,
                base: window_secs(executor.retry_base_secs),
                max: window_secs(executor.retry_max_secs),
            },
            confirmation_timeout: window_secs(executor.confirmation_timeout_secs),
            reopen_after: window_secs(config.indexer.max_staleness_secs),
            submit_timeout: Duration::from_millis(config.authority.timeout_ms),
        }
    }
}

/// What happened to one proposed action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Accepted by the authority provider
    Submitted { tx_ref: TxRef },
    /// A record for this key already exists and blocks resubmission
    SkippedDuplicate(SkipReason),
    /// Target or action kind outside the delegation's current scope
    SkippedOutOfScope,
    /// Delegation missing, paused or revoked at submission time
    DroppedInactive,
    /// Transient failure, another attempt is scheduled
    RetryScheduled { next_attempt_at: DateTime<Utc> },
    /// Retry budget exhausted
    Abandoned,
    /// Permanent failure
    Failed { error: String },
    /// Over the per-cycle limit, left for a later cycle
    Deferred,
}

impl ActionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ActionOutcome::Submitted { .. } => "submitted",
            ActionOutcome::SkippedDuplicate(_) => "skipped_duplicate",
            ActionOutcome::SkippedOutOfScope => "skipped_out_of_scope",
            ActionOutcome::DroppedInactive => "dropped_inactive",
            ActionOutcome::RetryScheduled { .. } => "retry_scheduled",
            ActionOutcome::Abandoned => "abandoned",
            ActionOutcome::Failed { .. } => "failed",
            ActionOutcome::Deferred => "deferred",
        }
    }

    /// Whether the authority provider was called
    fn reached_authority(&self) -> bool {
        matches!(
            self,
            ActionOutcome::Submitted { .. }
                | ActionOutcome::RetryScheduled { .. }
                | ActionOutcome::Abandoned
                | ActionOutcome::Failed { .. }
        )
    }
}

/// Outcome for one action, with its key
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub key: IdempotencyKey,
    pub action: ProposedAction,
    pub outcome: ActionOutcome,
}

/// Transaction executor
pub struct TransactionExecutor {
    registry: Arc<DelegationRegistry>,
    store: Arc<ExecutionStore>,
    authority: Arc<dyn AuthorityProvider>,
    settings: ExecutorSettings,
}

impl TransactionExecutor {
    pub fn new(
        registry: Arc<DelegationRegistry>,
        store: Arc<ExecutionStore>,
        authority: Arc<dyn AuthorityProvider>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            store,
            authority,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute one delegation's actions sequentially in rule-precedence order
    pub async fn execute(
        &self,
        delegation_id: &DelegationId,
        actions: Vec<ProposedAction>,
        gas_price_wei: Option<u128>,
    ) -> Vec<ActionResult> {
        self.execute_at(delegation_id, actions, gas_price_wei, Utc::now())
            .await
    }

    pub(crate) async fn execute_at(
        &self,
        delegation_id: &DelegationId,
        mut actions: Vec<ProposedAction>,
        gas_price_wei: Option<u128>,
        now: DateTime<Utc>,
    ) -> Vec<ActionResult> {
        actions.sort_by_key(|a| a.reason.precedence());

        let limit = self
            .registry
            .get(delegation_id)
            .await
            .map(|d| d.scope.limits.max_actions_per_cycle as usize)
            .unwrap_or(usize::MAX);

        let mut attempted = 0usize;
        let mut results = Vec::with_capacity(actions.len());

        for action in actions {
            let key = action.idempotency_key(delegation_id);
            let outcome = if attempted >= limit {
                ActionOutcome::Deferred
            } else {
                self.execute_one(delegation_id, &key, &action, gas_price_wei, now)
                    .await
            };

            if outcome.reached_authority() {
                attempted += 1;
            }

            debug!(
                delegation = %delegation_id,
                key = %key,
                reason = %action.reason,
                outcome = outcome.label(),
                "Action processed"
            );
            results.push(ActionResult {
                key,
                action,
                outcome,
            });
        }

        if attempted >= limit && results.iter().any(|r| r.outcome == ActionOutcome::Deferred) {
            info!(
                delegation = %delegation_id,
                limit,
                "Per-cycle action limit reached, deferring the rest"
            );
        }

        results
    }

    async fn execute_one(
        &self,
        delegation_id: &DelegationId,
        key: &IdempotencyKey,
        action: &ProposedAction,
        gas_price_wei: Option<u128>,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        if let Some(reason) = self
            .store
            .blocking_reason(key, now, self.settings.reopen_after)
        {
            return ActionOutcome::SkippedDuplicate(reason);
        }

        // Scope is read fresh, never taken from when the action was proposed
        let delegation = match self.active_delegation(delegation_id).await {
            Some(d) => d,
            None => return ActionOutcome::DroppedInactive,
        };

        if let Err(e) = check_scope(&delegation, action) {
            warn!(delegation = %delegation_id, key = %key, "{}", e);
            return ActionOutcome::SkippedOutOfScope;
        }

        let fee = gas_price_wei.unwrap_or(self.settings.fallback_gas_price_wei);
        let ceiling = delegation.scope.fee_ceiling(self.settings.fee_ceiling_wei);
        if fee > ceiling {
            let e = Error::FeeCeilingExceeded {
                offered: fee,
                ceiling,
            };
            warn!(delegation = %delegation_id, key = %key, "{}", e);
            return ActionOutcome::Failed {
                error: e.to_string(),
            };
        }

        let intent = match encode_intent(action, fee) {
            Ok(intent) => intent,
            Err(e) => return self.invariant_failure(delegation_id, key, e),
        };

        let claim = match self.store.claim(
            key,
            delegation_id,
            action,
            now,
            self.settings.reopen_after,
        ) {
            Ok(Claim::Busy(reason)) => return ActionOutcome::SkippedDuplicate(reason),
            Ok(claim) => claim,
            Err(e) => return self.invariant_failure(delegation_id, key, e),
        };

        // Durable intent before the external call
        if let Err(e) = self.store.save().await {
            error!(key = %key, "Failed to persist pending record: {}", e);
            self.store.release(key, &claim);
            return ActionOutcome::Failed {
                error: e.to_string(),
            };
        }

        // The delegation may have been revoked while we were claiming
        let delegation = match self.active_delegation(delegation_id).await {
            Some(d) => d,
            None => {
                info!(delegation = %delegation_id, key = %key, "Delegation revoked before submission");
                self.store.release(key, &claim);
                self.persist().await;
                return ActionOutcome::DroppedInactive;
            }
        };

        let request = SubmissionRequest {
            delegation_id: delegation.id.clone(),
            delegator: delegation.delegator,
            delegate: delegation.delegate,
            grant_proof: delegation.grant_proof.clone(),
            idempotency_key: key.clone(),
            intent,
        };

        let result = match tokio::time::timeout(
            self.settings.submit_timeout,
            self.authority.submit(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::AuthorityTimeout(
                self.settings.submit_timeout.as_millis() as u64,
            )),
        };

        let outcome = self.record_result(key, result, now);
        self.persist().await;
        outcome
    }

    fn record_result(
        &self,
        key: &IdempotencyKey,
        result: Result<TxRef>,
        now: DateTime<Utc>,
    ) -> ActionOutcome {
        match result {
            Ok(tx_ref) => {
                info!(key = %key, tx_ref = %tx_ref, "Action submitted");
                self.store.record_submitted(key, tx_ref.as_str(), now);
                ActionOutcome::Submitted { tx_ref }
            }
            Err(e) if e.is_retryable() => {
                warn!(key = %key, "Submission failed, will retry: {}", e);
                match self
                    .store
                    .record_transient_failure(key, &e, now, &self.settings.retry)
                {
                    FailureDisposition::RetryAt(next_attempt_at) => {
                        ActionOutcome::RetryScheduled { next_attempt_at }
                    }
                    FailureDisposition::Abandoned => ActionOutcome::Abandoned,
                    FailureDisposition::Failed => ActionOutcome::Failed {
                        error: e.to_string(),
                    },
                }
            }
            Err(e) => {
                if e.is_permanent() {
                    warn!(key = %key, "Submission failed permanently: {}", e);
                } else {
                    error!(key = %key, "Unclassified submission error, not retrying: {}", e);
                }
                self.store.record_permanent_failure(key, &e, now);
                ActionOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn invariant_failure(
        &self,
        delegation_id: &DelegationId,
        key: &IdempotencyKey,
        e: Error,
    ) -> ActionOutcome {
        error!(delegation = %delegation_id, key = %key, "{}", e);
        ActionOutcome::Failed {
            error: e.to_string(),
        }
    }

    async fn active_delegation(&self, delegation_id: &DelegationId) -> Option<Delegation> {
        self.registry
            .get(delegation_id)
            .await
            .filter(|d| d.is_active())
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save().await {
            error!("Failed to persist execution records: {}", e);
        }
    }

    /// Settle pending records against this cycle's snapshot
    pub async fn reconcile(
        &self,
        delegation_id: &DelegationId,
        snapshot: &WalletSnapshot,
    ) -> ReconcileSummary {
        let summary = self.store.reconcile(
            delegation_id,
            snapshot,
            Utc::now(),
            self.settings.confirmation_timeout,
            &self.settings.retry,
        );
        self.note_reconciled(delegation_id, &summary).await;
        summary
    }

    /// Settle the records of a paused or revoked delegation, submitting nothing
    ///
    /// Outstanding submissions are reconciled as usual. Once the delegation is
    /// revoked, records with nothing on-chain can never go out and are abandoned.
    pub async fn settle(
        &self,
        delegation: &Delegation,
        snapshot: &WalletSnapshot,
    ) -> ReconcileSummary {
        let now = Utc::now();
        let mut summary = self.store.reconcile(
            &delegation.id,
            snapshot,
            now,
            self.settings.confirmation_timeout,
            &self.settings.retry,
        );
        if delegation.status == DelegationStatus::Revoked {
            summary.abandoned += self.store.abandon_unsubmitted(
                &delegation.id,
                "delegation revoked before submission",
                now,
            );
        }
        self.note_reconciled(&delegation.id, &summary).await;
        summary
    }

    async fn note_reconciled(&self, delegation_id: &DelegationId, summary: &ReconcileSummary) {
        if summary.changed() {
            info!(
                delegation = %delegation_id,
                confirmed = summary.confirmed,
                superseded = summary.superseded,
                timed_out = summary.timed_out,
                abandoned = summary.abandoned,
                "Reconciled execution records"
            );
            self.persist().await;
        }
    }
}

fn check_scope(delegation: &Delegation, action: &ProposedAction) -> Result<()> {
    if action.owner != delegation.delegator {
        return Err(Error::ScopeViolation(format!(
            "owner {} is not delegator {}",
            action.owner, delegation.delegator
        )));
    }
    if !delegation.scope.permits(action.kind, &action.token) {
        return Err(Error::ScopeViolation(format!(
            "{} on {} not permitted by delegation {}",
            action.kind, action.token, delegation.id
        )));
    }
    Ok(())
}
