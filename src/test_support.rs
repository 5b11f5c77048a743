//! In-memory collaborators and fixtures shared by unit tests.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::delegation::{
    ActionKind, DelegationId, DelegationRegistry, RegistrationRequest, Scope, ScopeLimits,
};
use crate::error::{Error, Result};
use crate::executor::authority::{AuthorityProvider, SubmissionRequest, TxRef};
use crate::indexer::{ApprovalObservation, ApprovalStatus, Indexer, WalletSnapshot};

pub(crate) const AGENT: Address = Address::repeat_byte(0xA6);
pub(crate) const WALLET: Address = Address::repeat_byte(0x01);
pub(crate) const SPENDER: Address = Address::repeat_byte(0x02);
pub(crate) const TOKEN: Address = Address::repeat_byte(0x03);
pub(crate) const OTHER_TOKEN: Address = Address::repeat_byte(0x04);

/// Defaults plus an agent identity, which validation requires
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.agent.identity = AGENT;
    config
}

pub(crate) fn registration(delegator: Address, targets: Vec<Address>) -> RegistrationRequest {
    RegistrationRequest {
        delegator,
        delegate: AGENT,
        scope: Scope {
            targets,
            actions: vec![ActionKind::Revoke, ActionKind::Cleanup],
            limits: ScopeLimits::default(),
        },
        grant_proof: "proof".to_string(),
    }
}

pub(crate) async fn registry_with(
    request: RegistrationRequest,
) -> (Arc<DelegationRegistry>, DelegationId) {
    let registry = Arc::new(DelegationRegistry::new(None));
    let id = registry.register(request).await.unwrap();
    (registry, id)
}

pub(crate) fn approval(
    owner: Address,
    token: Address,
    spender: Address,
    amount: U256,
    now: DateTime<Utc>,
) -> ApprovalObservation {
    ApprovalObservation {
        owner,
        spender,
        token,
        amount,
        is_unlimited: false,
        is_risky: false,
        observed_at: now,
        granted_at: Some(now),
        last_used_at: None,
        status: ApprovalStatus::Active,
    }
}

pub(crate) fn snapshot(
    wallet: Address,
    approvals: Vec<ApprovalObservation>,
    now: DateTime<Utc>,
) -> WalletSnapshot {
    WalletSnapshot {
        wallet,
        approvals,
        gas_price_wei: Some(20_000_000_000),
        indexed_at: now,
    }
}

/// Indexer serving fixed snapshots, optionally failing the first reads
#[derive(Default)]
pub(crate) struct FakeIndexer {
    snapshots: Mutex<HashMap<Address, WalletSnapshot>>,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    revoke_after_read: Mutex<Option<(Arc<DelegationRegistry>, DelegationId)>>,
}

impl FakeIndexer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_snapshot(&self, snapshot: WalletSnapshot) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.wallet, snapshot);
    }

    /// Next `n` reads time out
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Revoke a delegation right after the next successful read
    pub(crate) fn revoke_after_read(&self, registry: Arc<DelegationRegistry>, id: DelegationId) {
        *self.revoke_after_read.lock().unwrap() = Some((registry, id));
    }
}

#[async_trait]
impl Indexer for FakeIndexer {
    async fn wallet_snapshot(&self, wallet: &Address) -> Result<Option<WalletSnapshot>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::IndexerTimeout(10));
        }
        let snapshot = self.snapshots.lock().unwrap().get(wallet).cloned();
        let hook = self.revoke_after_read.lock().unwrap().take();
        if let Some((registry, id)) = hook {
            registry.revoke(&id).await.unwrap();
        }
        Ok(snapshot)
    }
}

/// Authority provider that counts calls and replays scripted responses
#[derive(Default)]
pub(crate) struct FakeAuthority {
    calls: AtomicUsize,
    requests: Mutex<Vec<SubmissionRequest>>,
    script: Mutex<VecDeque<Result<TxRef>>>,
    delay: Option<Duration>,
}

impl FakeAuthority {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Each submission sleeps before answering
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a response; unscripted calls succeed
    pub(crate) fn push_response(&self, response: Result<TxRef>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<SubmissionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthorityProvider for FakeAuthority {
    async fn submit(&self, request: &SubmissionRequest) -> Result<TxRef> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(TxRef(format!("0x{:064x}", n))))
    }
}
