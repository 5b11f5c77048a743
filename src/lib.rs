//! Allowance Sentinel Library
//!
//! Wallet hygiene agent: holds scoped, revocable authority from wallets and
//! revokes unlimited, risky or stale token approvals on their behalf.

pub mod api;
pub mod cli;
pub mod config;
pub mod delegation;
pub mod error;
pub mod executor;
pub mod indexer;
pub mod monitor;
pub mod rules;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
