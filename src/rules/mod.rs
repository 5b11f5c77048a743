//! Rule engine
//!
//! Decides which approvals should be revoked. Deterministic, synchronous and
//! free of I/O so identical input always yields identical proposals.

pub mod engine;
pub mod policy;

pub use engine::{evaluate, evaluate_all, IdempotencyKey, ProposedAction, RevokeReason, RuleSet};
pub use policy::{FlaggedSpenderPolicy, LastUseWindow, RiskPolicy, UsagePolicy};
