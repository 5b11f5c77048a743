//! Delegated authority
//!
//! Wallets grant the agent scoped, revocable authority. The registry is the
//! single source of truth the scheduler and executor read from.

pub mod registry;
pub mod types;

pub use registry::DelegationRegistry;
pub use types::{
    ActionKind, Delegation, DelegationId, DelegationStatus, RegistrationRequest, Scope,
    ScopeLimits,
};
