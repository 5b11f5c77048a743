//! Execution record store
//!
//! Records are keyed by idempotency key in a `DashMap`. Claiming a key is a
//! single `entry()` call, so the check for an existing record and the creation
//! of a pending one cannot interleave between workers.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::delegation::DelegationId;
use crate::error::{Error, Result};
use crate::indexer::WalletSnapshot;
use crate::rules::{IdempotencyKey, ProposedAction};

use super::record::{ExecutionRecord, ExecutionStatus, RetryPolicy};

/// Why an action was not (re)submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another worker holds the record
    InFlight,
    /// Submitted, waiting for the chain to reflect it
    AwaitingConfirmation,
    /// Last attempt failed; next attempt not yet due
    BackingOff { until: DateTime<Utc> },
    /// Recently resolved; a reappearing approval may be stale indexer data
    RecentlyResolved(ExecutionStatus),
    /// Failed or abandoned; left for an operator
    NeedsReview(ExecutionStatus),
}

/// Result of claiming a key for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// A new pending record was created
    Fresh,
    /// A resolved record was replaced by a new pending generation
    Reopened { previous: Box<ExecutionRecord> },
    /// An existing pending record is due for another attempt
    Retry { attempt_count: u32 },
    Busy(SkipReason),
}

/// Outcome of a failed attempt after the retry policy is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    RetryAt(DateTime<Utc>),
    Abandoned,
    Failed,
}

/// Counts from reconciling one delegation's records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub confirmed: usize,
    pub superseded: usize,
    pub timed_out: usize,
    pub abandoned: usize,
}

impl ReconcileSummary {
    pub fn changed(&self) -> bool {
        self.confirmed + self.superseded + self.timed_out + self.abandoned > 0
    }
}

/// Execution record store
pub struct ExecutionStore {
    records: DashMap<IdempotencyKey, ExecutionRecord>,
    persistence_path: Option<String>,
    save_lock: Mutex<()>,
}

impl ExecutionStore {
    /// Create a new store
    pub fn new(persistence_path: Option<String>) -> Self {
        Self {
            records: DashMap::new(),
            persistence_path,
            save_lock: Mutex::new(()),
        }
    }

    /// Why `key` would not be submitted right now, without claiming it
    pub fn blocking_reason(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        reopen_after: Duration,
    ) -> Option<SkipReason> {
        self.records
            .get(key)
            .and_then(|record| Self::busy_reason(&record, now, reopen_after))
    }

    fn busy_reason(
        record: &ExecutionRecord,
        now: DateTime<Utc>,
        reopen_after: Duration,
    ) -> Option<SkipReason> {
        if record.in_flight {
            return Some(SkipReason::InFlight);
        }
        match record.status {
            ExecutionStatus::Pending if record.awaiting_confirmation() => {
                Some(SkipReason::AwaitingConfirmation)
            }
            ExecutionStatus::Pending => match record.next_attempt_at {
                Some(until) if until > now => Some(SkipReason::BackingOff { until }),
                _ => None,
            },
            ExecutionStatus::Failed | ExecutionStatus::Abandoned => {
                Some(SkipReason::NeedsReview(record.status))
            }
            ExecutionStatus::Confirmed | ExecutionStatus::Superseded => {
                if now - record.updated_at < reopen_after {
                    Some(SkipReason::RecentlyResolved(record.status))
                } else {
                    None
                }
            }
        }
    }

    /// Atomically claim `key` for a submission attempt
    ///
    /// A key already bound to a different payload is an invariant violation.
    pub fn claim(
        &self,
        key: &IdempotencyKey,
        delegation_id: &DelegationId,
        action: &ProposedAction,
        now: DateTime<Utc>,
        reopen_after: Duration,
    ) -> Result<Claim> {
        match self.records.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(ExecutionRecord::pending(
                    key.clone(),
                    delegation_id.clone(),
                    action.clone(),
                    now,
                ));
                Ok(Claim::Fresh)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();

                if record.fingerprint != action.fingerprint()
                    || record.delegation_id != *delegation_id
                {
                    return Err(Error::InvariantViolation(format!(
                        "idempotency key {} already bound to {:?} under delegation {}, got {:?} under {}",
                        key, record.action, record.delegation_id, action, delegation_id
                    )));
                }

                if let Some(reason) = Self::busy_reason(record, now, reopen_after) {
                    return Ok(Claim::Busy(reason));
                }

                if record.status.is_terminal() {
                    // Approval reappeared well after resolution: the wallet re-approved
                    let generation = record.generation + 1;
                    info!(
                        key = %key,
                        previous = %record.status,
                        generation,
                        "Reopening resolved action"
                    );
                    let mut reopened = ExecutionRecord::pending(
                        key.clone(),
                        delegation_id.clone(),
                        action.clone(),
                        now,
                    );
                    reopened.generation = generation;
                    let previous = std::mem::replace(record, reopened);
                    return Ok(Claim::Reopened {
                        previous: Box::new(previous),
                    });
                }

                record.in_flight = true;
                record.updated_at = now;
                Ok(Claim::Retry {
                    attempt_count: record.attempt_count,
                })
            }
        }
    }

    /// Undo a claim that never reached the authority provider
    pub fn release(&self, key: &IdempotencyKey, claim: &Claim) {
        match claim {
            Claim::Fresh => {
                // Nothing was attempted under a fresh claim
                self.records
                    .remove_if(key, |_, r| r.in_flight && r.attempt_count == 0);
            }
            Claim::Reopened { previous } => {
                if let Some(mut record) = self.records.get_mut(key) {
                    if record.in_flight && record.attempt_count == 0 {
                        *record = previous.as_ref().clone();
                    }
                }
            }
            Claim::Retry { .. } => {
                if let Some(mut record) = self.records.get_mut(key) {
                    record.in_flight = false;
                }
            }
            Claim::Busy(_) => {}
        }
    }

    /// Submission accepted
    pub fn record_submitted(&self, key: &IdempotencyKey, tx_ref: &str, now: DateTime<Utc>) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.attempt_count += 1;
            record.tx_ref = Some(tx_ref.to_string());
            record.submitted_at = Some(now);
            record.next_attempt_at = None;
            record.last_error = None;
            record.updated_at = now;
            record.in_flight = false;
        }
    }

    /// Transient failure: schedule a retry or abandon
    pub fn record_transient_failure(
        &self,
        key: &IdempotencyKey,
        error: &Error,
        now: DateTime<Utc>,
        retry: &RetryPolicy,
    ) -> FailureDisposition {
        let Some(mut record) = self.records.get_mut(key) else {
            return FailureDisposition::Failed;
        };
        record.attempt_count += 1;
        record.last_error = Some(error.to_string());
        record.updated_at = now;
        record.in_flight = false;
        Self::schedule_retry(&mut record, now, retry)
    }

    fn schedule_retry(
        record: &mut ExecutionRecord,
        now: DateTime<Utc>,
        retry: &RetryPolicy,
    ) -> FailureDisposition {
        if retry.exhausted(record.attempt_count) {
            record.status = ExecutionStatus::Abandoned;
            record.next_attempt_at = None;
            warn!(
                key = %record.idempotency_key,
                attempts = record.attempt_count,
                "Action abandoned after exhausting retries"
            );
            FailureDisposition::Abandoned
        } else {
            let at = now + retry.delay(record.attempt_count);
            record.next_attempt_at = Some(at);
            FailureDisposition::RetryAt(at)
        }
    }

    /// Permanent failure: terminal, never retried
    pub fn record_permanent_failure(&self, key: &IdempotencyKey, error: &Error, now: DateTime<Utc>) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.status = ExecutionStatus::Failed;
            record.last_error = Some(error.to_string());
            record.next_attempt_at = None;
            record.updated_at = now;
            record.in_flight = false;
        }
    }

    /// Settle one delegation's pending records against a fresh snapshot
    ///
    /// Approval gone and our tx landed before the snapshot: confirmed. Gone
    /// otherwise: superseded. Still present long after submission: the attempt
    /// is treated as failed and goes back through the retry policy.
    pub fn reconcile(
        &self,
        delegation_id: &DelegationId,
        snapshot: &WalletSnapshot,
        now: DateTime<Utc>,
        confirmation_timeout: Duration,
        retry: &RetryPolicy,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.delegation_id != *delegation_id
                || record.status != ExecutionStatus::Pending
                || record.in_flight
            {
                continue;
            }

            let present = snapshot.holds_live(&record.action.token, &record.action.spender);
            let indexed_after_submit = record
                .submitted_at
                .is_some_and(|submitted| snapshot.indexed_at >= submitted);

            if !present {
                if record.tx_ref.is_some() && indexed_after_submit {
                    record.status = ExecutionStatus::Confirmed;
                    summary.confirmed += 1;
                } else {
                    record.status = ExecutionStatus::Superseded;
                    summary.superseded += 1;
                }
                record.next_attempt_at = None;
                record.updated_at = now;
                debug!(key = %record.idempotency_key, status = %record.status, "Reconciled");
                continue;
            }

            let overdue = record
                .submitted_at
                .is_some_and(|submitted| now - submitted > confirmation_timeout);
            if record.awaiting_confirmation() && overdue && indexed_after_submit {
                warn!(
                    key = %record.idempotency_key,
                    tx_ref = record.tx_ref.as_deref().unwrap_or_default(),
                    "Submission not reflected on-chain in time"
                );
                record.last_error = Some(format!(
                    "not confirmed within {}s",
                    confirmation_timeout.num_seconds()
                ));
                record.tx_ref = None;
                record.updated_at = now;
                summary.timed_out += 1;
                if Self::schedule_retry(record, now, retry) == FailureDisposition::Abandoned {
                    summary.abandoned += 1;
                }
            }
        }

        summary
    }

    /// Delegations that still own pending records
    pub fn delegations_with_pending(&self) -> Vec<DelegationId> {
        let mut ids: Vec<DelegationId> = self
            .records
            .iter()
            .filter(|r| r.status == ExecutionStatus::Pending)
            .map(|r| r.delegation_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Abandon pending records with nothing outstanding on-chain
    ///
    /// Used once a delegation is revoked: those records can no longer be
    /// submitted, so they go to review instead of waiting forever.
    pub fn abandon_unsubmitted(
        &self,
        delegation_id: &DelegationId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let mut abandoned = 0;
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.delegation_id != *delegation_id
                || record.status != ExecutionStatus::Pending
                || record.in_flight
                || record.awaiting_confirmation()
            {
                continue;
            }
            record.status = ExecutionStatus::Abandoned;
            record.last_error = Some(reason.to_string());
            record.next_attempt_at = None;
            record.updated_at = now;
            abandoned += 1;
            warn!(key = %record.idempotency_key, "Abandoned: {}", reason);
        }
        abandoned
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<ExecutionRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Records, optionally for one delegation, newest first
    pub fn list(&self, delegation_id: Option<&DelegationId>) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| delegation_id.map_or(true, |id| r.delegation_id == *id))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }

    /// Failed and abandoned records awaiting an operator
    pub fn review_queue(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| r.status.needs_review())
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }

    /// Load records from disk
    pub async fn load(&self) -> Result<()> {
        if let Some(path) = &self.persistence_path {
            if Path::new(path).exists() {
                let data = tokio::fs::read_to_string(path).await?;
                let records: Vec<ExecutionRecord> = serde_json::from_str(&data)?;

                self.records.clear();
                for record in records {
                    self.records.insert(record.idempotency_key.clone(), record);
                }

                info!("Loaded {} execution records from {}", self.records.len(), path);
            }
        }
        Ok(())
    }

    /// Save records to disk
    pub async fn save(&self) -> Result<()> {
        if let Some(path) = &self.persistence_path {
            let _guard = self.save_lock.lock().await;
            let records = self.list(None);
            let data = serde_json::to_string_pretty(&records)?;

            // Write-then-rename so a crash never leaves a torn file
            let tmp = format!("{}.tmp", path);
            tokio::fs::write(&tmp, data)
                .await
                .map_err(|e| Error::Persistence(e.to_string()))?;
            tokio::fs::rename(&tmp, path).await.map_err(|e| {
                error!("Failed to persist execution records to {}: {}", path, e);
                Error::Persistence(e.to_string())
            })?;

            debug!("Saved {} execution records to {}", records.len(), path);
        }
        Ok(())
    }
}
