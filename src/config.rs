//! Configuration loading and validation

use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

/// Longest window any duration setting may express, in days
pub const MAX_WINDOW_DAYS: u64 = 36_500;
const MAX_WINDOW_SECS: u64 = MAX_WINDOW_DAYS * 86_400;

/// Whole days as a `chrono` duration, clamped to `MAX_WINDOW_DAYS`
pub fn window_days(days: u64) -> chrono::Duration {
    chrono::Duration::days(days.min(MAX_WINDOW_DAYS) as i64)
}

/// Seconds as a `chrono` duration, clamped to `MAX_WINDOW_DAYS`
pub fn window_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Identity the agent acts as when holding delegated authority
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub identity: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between evaluation cycles
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on delegations evaluated at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_delegations: usize,
    /// Run a cycle immediately on startup instead of waiting one interval
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    /// Allowances at or above this amount count as unlimited.
    /// Decimal or 0x-prefixed hex; defaults to 2^255.
    #[serde(default)]
    pub unlimited_threshold: Option<String>,
    /// Approvals older than this without recent use are revoked
    #[serde(default = "default_staleness_days")]
    pub staleness_threshold_days: u64,
    /// A spend inside this window counts as recent usage
    #[serde(default = "default_usage_window_days")]
    pub usage_window_days: u64,
    /// Spenders always treated as risky regardless of indexer flags
    #[serde(default)]
    pub risky_spenders: Vec<Address>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Submission attempts before a record is abandoned
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: u64,
    /// Hard ceiling on the fee a submission may carry
    #[serde(default = "default_max_fee_gwei")]
    pub max_fee_per_gas_gwei: u64,
    /// Used when the indexer snapshot carries no gas price
    #[serde(default = "default_fallback_gas_gwei")]
    pub fallback_gas_price_gwei: u64,
    /// Submitted records still unresolved after this long count as failed attempts
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default)]
    pub records_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_indexer_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// How far behind chain head indexer data may be
    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: u64,
    /// Upper bound on in-cycle retries of a failed read
    #[serde(default = "default_retry_max_elapsed_ms")]
    pub retry_max_elapsed_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default = "default_authority_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_authority_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    8
}

fn default_staleness_days() -> u64 {
    30
}

fn default_usage_window_days() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_secs() -> u64 {
    60
}

fn default_retry_max_secs() -> u64 {
    3600
}

fn default_max_fee_gwei() -> u64 {
    200
}

fn default_fallback_gas_gwei() -> u64 {
    30
}

fn default_confirmation_timeout_secs() -> u64 {
    1800
}

fn default_indexer_endpoint() -> String {
    "http://127.0.0.1:4000".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_staleness_secs() -> u64 {
    600
}

fn default_retry_max_elapsed_ms() -> u64 {
    3_000
}

fn default_authority_endpoint() -> String {
    "http://127.0.0.1:4100".to_string()
}

fn default_authority_timeout_ms() -> u64 {
    15_000
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrent_delegations: default_max_concurrent(),
            run_on_startup: true,
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            unlimited_threshold: None,
            staleness_threshold_days: default_staleness_days(),
            usage_window_days: default_usage_window_days(),
            risky_spenders: Vec::new(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
            max_fee_per_gas_gwei: default_max_fee_gwei(),
            fallback_gas_price_gwei: default_fallback_gas_gwei(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            records_path: None,
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_indexer_endpoint(),
            timeout_ms: default_timeout_ms(),
            max_staleness_secs: default_max_staleness_secs(),
            retry_max_elapsed_ms: default_retry_max_elapsed_ms(),
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            endpoint: default_authority_endpoint(),
            timeout_ms: default_authority_timeout_ms(),
            api_key: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

impl RulesConfig {
    /// Parse the configured unlimited threshold (2^255 when unset)
    pub fn threshold_amount(&self) -> Result<U256> {
        match &self.unlimited_threshold {
            Some(raw) => U256::from_str(raw.trim())
                .with_context(|| format!("Invalid unlimited_threshold: {}", raw)),
            None => Ok(U256::from(1u8) << 255_usize),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SENTINEL_)
            .add_source(
                config::Environment::with_prefix("SENTINEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.agent.identity == Address::ZERO {
            anyhow::bail!("agent.identity must be set to the agent's delegate address");
        }

        if self.scheduler.interval_secs == 0 {
            anyhow::bail!("scheduler.interval_secs must be positive");
        }

        if self.scheduler.max_concurrent_delegations == 0 {
            anyhow::bail!("scheduler.max_concurrent_delegations must be positive");
        }

        let threshold = self.rules.threshold_amount()?;
        if threshold.is_zero() {
            anyhow::bail!("rules.unlimited_threshold cannot be zero");
        }

        if self.rules.staleness_threshold_days == 0 {
            anyhow::bail!("rules.staleness_threshold_days must be positive");
        }

        for (name, days) in [
            ("rules.staleness_threshold_days", self.rules.staleness_threshold_days),
            ("rules.usage_window_days", self.rules.usage_window_days),
        ] {
            if days > MAX_WINDOW_DAYS {
                anyhow::bail!("{} cannot exceed {} days", name, MAX_WINDOW_DAYS);
            }
        }

        for (name, secs) in [
            ("scheduler.interval_secs", self.scheduler.interval_secs),
            ("executor.retry_base_secs", self.executor.retry_base_secs),
            ("executor.retry_max_secs", self.executor.retry_max_secs),
            (
                "executor.confirmation_timeout_secs",
                self.executor.confirmation_timeout_secs,
            ),
            ("indexer.max_staleness_secs", self.indexer.max_staleness_secs),
        ] {
            if secs > MAX_WINDOW_SECS {
                anyhow::bail!("{} cannot exceed {} seconds", name, MAX_WINDOW_SECS);
            }
        }

        if self.executor.max_attempts == 0 {
            anyhow::bail!("executor.max_attempts must be at least 1");
        }

        if self.executor.retry_base_secs > self.executor.retry_max_secs {
            anyhow::bail!(
                "executor.retry_base_secs ({}) cannot exceed retry_max_secs ({})",
                self.executor.retry_base_secs,
                self.executor.retry_max_secs
            );
        }

        if self.executor.max_fee_per_gas_gwei == 0 {
            anyhow::bail!("executor.max_fee_per_gas_gwei must be positive");
        }

        if self.indexer.timeout_ms == 0 || self.authority.timeout_ms == 0 {
            anyhow::bail!("external call timeouts must be positive");
        }

        if self.api.enabled {
            self.api
                .bind
                .parse::<std::net::SocketAddr>()
                .with_context(|| format!("Invalid api.bind address: {}", self.api.bind))?;
        }

        // A fallback above the ceiling would fail every action on a quiet indexer
        if self.executor.fallback_gas_price_gwei > self.executor.max_fee_per_gas_gwei {
            tracing::warn!(
                "fallback_gas_price_gwei ({}) exceeds max_fee_per_gas_gwei ({}); submissions without an indexer gas price will fail",
                self.executor.fallback_gas_price_gwei,
                self.executor.max_fee_per_gas_gwei
            );
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Agent:
    identity: {}
  Scheduler:
    interval: {}s
    max_concurrent_delegations: {}
    run_on_startup: {}
  Rules:
    unlimited_threshold: {}
    staleness_threshold: {} days
    usage_window: {} days
    risky_spenders: {}
  Executor:
    max_attempts: {}
    retry: {}s..{}s
    max_fee_per_gas: {} gwei
    records_path: {}
  Indexer:
    endpoint: {}
    timeout: {}ms
    max_staleness: {}s
  Authority:
    endpoint: {}
    timeout: {}ms
    api_key: {}
  API:
    enabled: {}
    bind: {}
"#,
            self.agent.identity,
            self.scheduler.interval_secs,
            self.scheduler.max_concurrent_delegations,
            self.scheduler.run_on_startup,
            self.rules
                .unlimited_threshold
                .as_deref()
                .unwrap_or("2^255 (default)"),
            self.rules.staleness_threshold_days,
            self.rules.usage_window_days,
            self.rules.risky_spenders.len(),
            self.executor.max_attempts,
            self.executor.retry_base_secs,
            self.executor.retry_max_secs,
            self.executor.max_fee_per_gas_gwei,
            self.executor.records_path.as_deref().unwrap_or("(memory)"),
            mask_url(&self.indexer.endpoint),
            self.indexer.timeout_ms,
            self.indexer.max_staleness_secs,
            mask_url(&self.authority.endpoint),
            self.authority.timeout_ms,
            if self.authority.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.api.enabled,
            self.api.bind,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}
