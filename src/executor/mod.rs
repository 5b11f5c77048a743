//! Transaction execution
//!
//! Submits revocations under delegated authority with at-most-once semantics
//! per idempotency key, bounded retries and reconciliation against later
//! indexer snapshots.

pub mod authority;
#[allow(clippy::module_inception)]
pub mod executor;
pub mod intent;
pub mod record;
pub mod store;

pub use authority::{AuthorityProvider, HttpAuthority, Rejection, SubmissionRequest, TxRef};
pub use executor::{ActionOutcome, ActionResult, ExecutorSettings, TransactionExecutor};
pub use intent::{encode_intent, TxIntent};
pub use record::{ExecutionRecord, ExecutionStatus, RetryPolicy};
pub use store::{Claim, ExecutionStore, ReconcileSummary, SkipReason};
