//! Periodic evaluation driver
//!
//! One interval loop dispatches cycles. A cycle lists the agent's active
//! delegations and evaluates them on a bounded pool; within a delegation the
//! only suspension points are the indexer read and the authority submissions.
//! Paused or revoked delegations that still own pending records are settled
//! against a fresh snapshot in the same pool, but nothing is submitted for them.
//! Cycles never overlap: a tick that arrives while a cycle is running is
//! skipped and counted.

use alloy_primitives::Address;
use backoff::{future::retry, ExponentialBackoff};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{window_secs, Config};
use crate::delegation::{Delegation, DelegationId, DelegationRegistry};
use crate::error::{Error, Result};
use crate::executor::{ActionResult, ReconcileSummary, TransactionExecutor};
use crate::indexer::{Indexer, WalletSnapshot};
use crate::rules::{evaluate_all, RuleSet};

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Agent identity whose delegations are evaluated
    pub identity: Address,
    pub interval: Duration,
    pub max_concurrent: usize,
    pub run_on_startup: bool,
    pub indexer_timeout: Duration,
    /// Bound on in-cycle retries of a failed indexer read
    pub retry_max_elapsed: Duration,
    pub max_staleness: chrono::Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            identity: config.agent.identity,
            interval: Duration::from_secs(config.scheduler.interval_secs),
            max_concurrent: config.scheduler.max_concurrent_delegations,
            run_on_startup: config.scheduler.run_on_startup,
            indexer_timeout: Duration::from_millis(config.indexer.timeout_ms),
            retry_max_elapsed: Duration::from_millis(config.indexer.retry_max_elapsed_ms),
            max_staleness: window_secs(config.indexer.max_staleness_secs),
        }
    }
}

/// Per-delegation result of a cycle
#[derive(Debug, Default)]
struct DelegationRun {
    indexed: bool,
    proposed: usize,
    results: Vec<ActionResult>,
    reconciled: ReconcileSummary,
}

/// Summary of one evaluation cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    pub delegations: usize,
    /// Delegations whose evaluation failed; isolated from the rest
    pub failed: usize,
    pub never_indexed: usize,
    pub proposed: usize,
    /// Action outcomes by label
    pub outcomes: BTreeMap<&'static str, usize>,
    pub confirmed: usize,
    pub superseded: usize,
    /// Inactive delegations whose pending records were settled
    pub settling: usize,
    pub abandoned: usize,
}

impl CycleReport {
    pub fn outcome(&self, label: &str) -> usize {
        self.outcomes.get(label).copied().unwrap_or(0)
    }
}

/// Resets the single-flight flag even if the cycle panics
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Wallet monitor
pub struct WalletMonitor {
    registry: Arc<DelegationRegistry>,
    indexer: Arc<dyn Indexer>,
    executor: Arc<TransactionExecutor>,
    rules: RuleSet,
    settings: MonitorSettings,
    cycle_running: AtomicBool,
    skipped_ticks: AtomicU64,
}

impl WalletMonitor {
    pub fn new(
        registry: Arc<DelegationRegistry>,
        indexer: Arc<dyn Indexer>,
        executor: Arc<TransactionExecutor>,
        rules: RuleSet,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            registry,
            indexer,
            executor,
            rules,
            settings,
            cycle_running: AtomicBool::new(false),
            skipped_ticks: AtomicU64::new(0),
        }
    }

    /// Ticks skipped because a cycle was still running
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks.load(Ordering::Relaxed)
    }

    /// Run cycles on the interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Starting wallet monitor (interval: {}s, concurrency: {}, identity: {})",
            self.settings.interval.as_secs(),
            self.settings.max_concurrent,
            self.settings.identity
        );

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        if !self.settings.run_on_startup {
            // First tick completes immediately
            interval.tick().await;
        }

        let mut current: Option<JoinHandle<Option<CycleReport>>> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.cycle_running.load(Ordering::SeqCst) {
                        self.note_skipped();
                        continue;
                    }
                    let monitor = self.clone();
                    current = Some(tokio::spawn(async move { monitor.trigger_cycle().await }));
                }
                _ = shutdown.recv() => {
                    info!("Wallet monitor shutting down");
                    break;
                }
            }
        }

        if let Some(handle) = current {
            if !handle.is_finished() {
                info!("Waiting for in-flight cycle to finish");
            }
            if let Err(e) = handle.await {
                warn!("Evaluation cycle task failed: {}", e);
            }
        }
    }

    fn note_skipped(&self) {
        let skipped = self.skipped_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(skipped, "Previous cycle still running, skipping tick");
    }

    /// Run a cycle unless one is already running
    pub async fn trigger_cycle(&self) -> Option<CycleReport> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.note_skipped();
            return None;
        }
        let _guard = CycleGuard(&self.cycle_running);
        Some(self.run_cycle().await)
    }

    async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let start = Instant::now();

        let delegations = self.registry.list_active(&self.settings.identity).await;
        let settling = self.settling_delegations(&delegations).await;
        debug!(
            "Evaluating {} active delegations, settling {} inactive",
            delegations.len(),
            settling.len()
        );

        let mut report = CycleReport {
            started_at: Some(started_at),
            delegations: delegations.len(),
            settling: settling.len(),
            ..Default::default()
        };

        let work = delegations
            .into_iter()
            .map(|d| (d, true))
            .chain(settling.into_iter().map(|d| (d, false)));
        let runs: Vec<(DelegationId, Result<DelegationRun>)> = stream::iter(work)
            .map(|(delegation, active)| async move {
                let id = delegation.id.clone();
                let run = if active {
                    self.evaluate_delegation(delegation).await
                } else {
                    self.settle_delegation(delegation).await
                };
                (id, run)
            })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await;

        for (id, run) in runs {
            match run {
                Ok(run) => {
                    if !run.indexed {
                        report.never_indexed += 1;
                    }
                    report.proposed += run.proposed;
                    report.confirmed += run.reconciled.confirmed;
                    report.superseded += run.reconciled.superseded;
                    report.abandoned += run.reconciled.abandoned;
                    for result in &run.results {
                        *report.outcomes.entry(result.outcome.label()).or_insert(0) += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(delegation = %id, "Delegation evaluation failed: {}", e);
                }
            }
        }

        report.elapsed = start.elapsed();
        info!(
            delegations = report.delegations,
            settling = report.settling,
            failed = report.failed,
            proposed = report.proposed,
            submitted = report.outcome("submitted"),
            confirmed = report.confirmed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Evaluation cycle complete"
        );
        report
    }

    /// This agent's paused or revoked delegations that still own pending records
    async fn settling_delegations(&self, active: &[Delegation]) -> Vec<Delegation> {
        let mut settling = Vec::new();
        for id in self.executor.store().delegations_with_pending() {
            if active.iter().any(|d| d.id == id) {
                continue;
            }
            match self.registry.get(&id).await {
                Some(d) if d.delegate == self.settings.identity && !d.is_active() => {
                    settling.push(d)
                }
                _ => {}
            }
        }
        settling
    }

    async fn settle_delegation(&self, delegation: Delegation) -> Result<DelegationRun> {
        let Some(snapshot) = self.fresh_snapshot(&delegation).await? else {
            return Ok(DelegationRun::default());
        };
        let reconciled = self.executor.settle(&delegation, &snapshot).await;
        Ok(DelegationRun {
            indexed: true,
            reconciled,
            ..Default::default()
        })
    }

    async fn evaluate_delegation(&self, delegation: Delegation) -> Result<DelegationRun> {
        let Some(snapshot) = self.fresh_snapshot(&delegation).await? else {
            return Ok(DelegationRun::default());
        };

        let now = Utc::now();
        let reconciled = self.executor.reconcile(&delegation.id, &snapshot).await;

        let actions = evaluate_all(&snapshot.approvals, &self.rules, now);
        let proposed = actions.len();
        let results = if actions.is_empty() {
            Vec::new()
        } else {
            self.executor
                .execute(&delegation.id, actions, snapshot.gas_price_wei)
                .await
        };

        Ok(DelegationRun {
            indexed: true,
            proposed,
            results,
            reconciled,
        })
    }

    /// Snapshot of the delegator's wallet, refused when it trails too far
    async fn fresh_snapshot(&self, delegation: &Delegation) -> Result<Option<WalletSnapshot>> {
        let Some(snapshot) = self.fetch_snapshot(&delegation.delegator).await? else {
            debug!(delegation = %delegation.id, "Wallet {} never indexed", delegation.delegator);
            return Ok(None);
        };

        let lag = snapshot.lag(Utc::now());
        if lag > self.settings.max_staleness {
            return Err(Error::IndexerStale {
                lag_secs: lag.num_seconds(),
                max_secs: self.settings.max_staleness.num_seconds().max(0) as u64,
            });
        }
        Ok(Some(snapshot))
    }

    /// Indexer read with a timeout, retried in-cycle on transient errors
    async fn fetch_snapshot(&self, wallet: &Address) -> Result<Option<WalletSnapshot>> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(1000),
            max_elapsed_time: Some(self.settings.retry_max_elapsed),
            ..Default::default()
        };
        let timeout = self.settings.indexer_timeout;

        retry(backoff, || async {
            let read = tokio::time::timeout(timeout, self.indexer.wallet_snapshot(wallet))
                .await
                .unwrap_or(Err(Error::IndexerTimeout(timeout.as_millis() as u64)));
            match read {
                Ok(snapshot) => Ok(snapshot),
                Err(e) if e.is_retryable() => {
                    debug!("Retryable indexer error for {}: {}", wallet, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionStore, ExecutorSettings};
    use crate::test_support::*;
    use alloy_primitives::U256;

    struct Harness {
        registry: Arc<DelegationRegistry>,
        indexer: Arc<FakeIndexer>,
        authority: Arc<FakeAuthority>,
        store: Arc<ExecutionStore>,
        monitor: Arc<WalletMonitor>,
    }

    fn harness(authority: FakeAuthority, tweak: impl FnOnce(&mut Config)) -> Harness {
        let mut config = test_config();
        tweak(&mut config);
        let registry = Arc::new(DelegationRegistry::new(None));
        let indexer = Arc::new(FakeIndexer::new());
        let authority = Arc::new(authority);
        let store = Arc::new(ExecutionStore::new(None));
        let executor = Arc::new(TransactionExecutor::new(
            registry.clone(),
            store.clone(),
            authority.clone(),
            ExecutorSettings::from_config(&config),
        ));
        let monitor = Arc::new(WalletMonitor::new(
            registry.clone(),
            indexer.clone(),
            executor,
            RuleSet::from_config(&config.rules).unwrap(),
            MonitorSettings::from_config(&config),
        ));
        Harness {
            registry,
            indexer,
            authority,
            store,
            monitor,
        }
    }

    fn unlimited(now: DateTime<Utc>) -> WalletSnapshot {
        snapshot(
            WALLET,
            vec![approval(WALLET, TOKEN, SPENDER, U256::MAX, now)],
            now,
        )
    }

    #[tokio::test]
    async fn test_cycle_revokes_unlimited_approval() {
        let h = harness(FakeAuthority::new(), |_| {});
        h.registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        let now = Utc::now();
        h.indexer.set_snapshot(snapshot(
            WALLET,
            vec![
                approval(WALLET, TOKEN, SPENDER, U256::MAX, now),
                approval(WALLET, TOKEN, Address::repeat_byte(0x05), U256::from(50u64), now),
            ],
            now,
        ));

        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.delegations, 1);
        assert_eq!(report.proposed, 1);
        assert_eq!(report.outcome("submitted"), 1);
        assert_eq!(h.authority.calls(), 1);
        assert_eq!(h.authority.requests()[0].intent.to, TOKEN);

        // Still visible in the next snapshot: awaiting confirmation, not resubmitted
        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.outcome("skipped_duplicate"), 1);
        assert_eq!(h.authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_only_agent_delegations_evaluated() {
        let h = harness(FakeAuthority::new(), |_| {});
        let mut foreign = registration(WALLET, vec![TOKEN]);
        foreign.delegate = Address::repeat_byte(0x77);
        h.registry.register(foreign).await.unwrap();

        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.delegations, 0);
        assert_eq!(h.indexer.calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_isolated_per_delegation() {
        let h = harness(FakeAuthority::new(), |_| {});
        let stale_wallet = Address::repeat_byte(0x0A);
        h.registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        h.registry
            .register(registration(stale_wallet, vec![TOKEN]))
            .await
            .unwrap();

        let now = Utc::now();
        h.indexer.set_snapshot(snapshot(
            WALLET,
            vec![approval(WALLET, TOKEN, SPENDER, U256::MAX, now)],
            now,
        ));
        h.indexer.set_snapshot(snapshot(
            stale_wallet,
            vec![approval(stale_wallet, TOKEN, SPENDER, U256::MAX, now)],
            now - chrono::Duration::hours(2),
        ));

        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.delegations, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcome("submitted"), 1);
        assert_eq!(h.authority.calls(), 1);
        assert_eq!(h.authority.requests()[0].delegator, WALLET);
    }

    #[tokio::test]
    async fn test_never_indexed_wallet_is_not_an_error() {
        let h = harness(FakeAuthority::new(), |_| {});
        h.registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();

        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.never_indexed, 1);
        assert_eq!(h.authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_indexer_errors_retried_in_cycle() {
        let h = harness(FakeAuthority::new(), |_| {});
        h.registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        let now = Utc::now();
        h.indexer.set_snapshot(snapshot(
            WALLET,
            vec![approval(WALLET, TOKEN, SPENDER, U256::MAX, now)],
            now,
        ));
        h.indexer.fail_next(2);

        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.outcome("submitted"), 1);
        assert_eq!(h.indexer.calls(), 3);
    }

    #[tokio::test]
    async fn test_indexer_outage_fails_delegation_without_submitting() {
        let h = harness(FakeAuthority::new(), |c| c.indexer.retry_max_elapsed_ms = 100);
        h.registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        h.indexer.fail_next(usize::MAX);

        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(h.authority.calls(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_cycle_is_skipped() {
        let h = harness(
            FakeAuthority::new().with_delay(Duration::from_millis(200)),
            |_| {},
        );
        h.registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        let now = Utc::now();
        h.indexer.set_snapshot(snapshot(
            WALLET,
            vec![approval(WALLET, TOKEN, SPENDER, U256::MAX, now)],
            now,
        ));

        let monitor = h.monitor.clone();
        let first = tokio::spawn(async move { monitor.trigger_cycle().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.monitor.trigger_cycle().await.is_none());
        assert_eq!(h.monitor.skipped_ticks(), 1);

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.outcome("submitted"), 1);
        assert_eq!(h.authority.calls(), 1);

        // Flag released once the cycle finished
        assert!(h.monitor.trigger_cycle().await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_cycle() {
        let h = harness(
            FakeAuthority::new().with_delay(Duration::from_millis(100)),
            |c| c.scheduler.interval_secs = 3600,
        );
        h.registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        let now = Utc::now();
        h.indexer.set_snapshot(snapshot(
            WALLET,
            vec![approval(WALLET, TOKEN, SPENDER, U256::MAX, now)],
            now,
        ));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = tokio::spawn(h.monitor.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();

        // The startup cycle ran to completion before run() returned
        assert_eq!(h.authority.calls(), 1);
        assert!(h.monitor.trigger_cycle().await.is_some());
    }

    #[tokio::test]
    async fn test_revoked_delegation_submission_still_confirms() {
        let h = harness(FakeAuthority::new(), |_| {});
        let id = h
            .registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        h.indexer.set_snapshot(unlimited(Utc::now()));
        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.outcome("submitted"), 1);

        h.registry.revoke(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        h.indexer
            .set_snapshot(snapshot(WALLET, Vec::new(), Utc::now()));

        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.delegations, 0);
        assert_eq!(report.settling, 1);
        assert_eq!(report.confirmed, 1);
        assert!(h.store.delegations_with_pending().is_empty());

        // Nothing left to settle
        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.settling, 0);
        assert_eq!(h.authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_revoked_delegation_retry_is_abandoned() {
        let authority = FakeAuthority::new();
        authority.push_response(Err(Error::AuthorityUnavailable("503".to_string())));
        let h = harness(authority, |_| {});
        let id = h
            .registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        h.indexer.set_snapshot(unlimited(Utc::now()));
        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.outcome("retry_scheduled"), 1);

        h.registry.revoke(&id).await.unwrap();
        h.indexer.set_snapshot(unlimited(Utc::now()));
        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.settling, 1);
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.proposed, 0);
        assert_eq!(h.authority.calls(), 1);
        assert_eq!(h.store.review_queue().len(), 1);
    }

    #[tokio::test]
    async fn test_paused_delegation_keeps_retry_pending() {
        let authority = FakeAuthority::new();
        authority.push_response(Err(Error::AuthorityUnavailable("503".to_string())));
        let h = harness(authority, |_| {});
        let id = h
            .registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        h.indexer.set_snapshot(unlimited(Utc::now()));
        h.monitor.trigger_cycle().await.unwrap();

        h.registry.pause(&id).await.unwrap();
        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.settling, 1);
        assert_eq!(report.abandoned, 0);
        assert_eq!(h.store.delegations_with_pending(), vec![id]);
        assert_eq!(h.authority.calls(), 1);
    }

    #[tokio::test]
    async fn test_revoke_during_cycle_submits_nothing() {
        let h = harness(FakeAuthority::new(), |_| {});
        let id = h
            .registry
            .register(registration(WALLET, vec![TOKEN]))
            .await
            .unwrap();
        h.indexer.set_snapshot(unlimited(Utc::now()));
        h.indexer.revoke_after_read(h.registry.clone(), id);

        let report = h.monitor.trigger_cycle().await.unwrap();
        assert_eq!(report.proposed, 1);
        assert_eq!(report.outcome("dropped_inactive"), 1);
        assert_eq!(h.authority.calls(), 0);
        assert!(h.store.list(None).is_empty());
    }
}
