//! Wallet monitoring
//!
//! The scheduler drives periodic evaluation of every active delegation; the
//! health module summarizes a wallet for the API.

pub mod health;
pub mod scheduler;

pub use health::{assess, HealthSummary, WalletHealth};
pub use scheduler::{CycleReport, MonitorSettings, WalletMonitor};
