//! CLI command implementations

use alloy_primitives::Address;
use anyhow::{Context, Result};
use chrono::Utc;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::config::Config;
use crate::delegation::DelegationRegistry;
use crate::executor::{ExecutionStore, ExecutorSettings, HttpAuthority, TransactionExecutor};
use crate::indexer::{HttpIndexer, Indexer};
use crate::monitor::{assess, MonitorSettings, WalletHealth, WalletMonitor};
use crate::rules::{evaluate_all, RuleSet};

/// Start the agent: scheduler plus, unless disabled, the HTTP API
pub async fn start(config: &Config, no_api: bool) -> Result<()> {
    info!("Starting allowance sentinel as {}", config.agent.identity);
    info!(
        "Interval: {}s, concurrency: {}, fee ceiling: {} gwei",
        config.scheduler.interval_secs,
        config.scheduler.max_concurrent_delegations,
        config.executor.max_fee_per_gas_gwei
    );

    let registry = Arc::new(DelegationRegistry::new(config.registry.path.clone()));
    registry
        .load()
        .await
        .context("Failed to load delegation registry")?;

    let store = Arc::new(ExecutionStore::new(config.executor.records_path.clone()));
    store
        .load()
        .await
        .context("Failed to load execution records")?;

    let review = store.review_queue();
    if !review.is_empty() {
        warn!("{} actions are waiting for review", review.len());
    }

    let indexer: Arc<dyn Indexer> = Arc::new(HttpIndexer::new(&config.indexer)?);
    let authority = Arc::new(HttpAuthority::new(&config.authority)?);
    let rules = RuleSet::from_config(&config.rules)?;

    let executor = Arc::new(TransactionExecutor::new(
        registry.clone(),
        store.clone(),
        authority,
        ExecutorSettings::from_config(config),
    ));

    let monitor = Arc::new(WalletMonitor::new(
        registry.clone(),
        indexer.clone(),
        executor,
        rules.clone(),
        MonitorSettings::from_config(config),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let monitor_handle = tokio::spawn(monitor.run(shutdown_tx.subscribe()));

    let api_handle = if config.api.enabled && !no_api {
        let addr = config
            .api
            .bind
            .parse()
            .with_context(|| format!("Invalid API bind address {}", config.api.bind))?;
        let state = Arc::new(AppState {
            identity: config.agent.identity,
            registry: registry.clone(),
            indexer,
            store: store.clone(),
            rules,
        });
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(addr, state, shutdown).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        info!("HTTP API disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(());

    if let Err(e) = monitor_handle.await {
        error!("Wallet monitor task failed: {}", e);
    }
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!("API task failed: {}", e);
        }
    }

    // Final flush of both stores
    if let Err(e) = registry.save().await {
        error!("Failed to save delegation registry: {}", e);
    }
    if let Err(e) = store.save().await {
        error!("Failed to save execution records: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Evaluate one wallet against the rules without submitting anything
pub async fn scan(config: &Config, wallet: &str) -> Result<()> {
    let wallet = Address::from_str(wallet).with_context(|| format!("Invalid address {}", wallet))?;
    let indexer = HttpIndexer::new(&config.indexer)?;
    let rules = RuleSet::from_config(&config.rules)?;
    let now = Utc::now();

    println!("\n=== WALLET SCAN: {} ===\n", wallet);

    let Some(snapshot) = indexer.wallet_snapshot(&wallet).await? else {
        println!("Wallet has never been indexed.");
        return Ok(());
    };

    let WalletHealth::Indexed(summary) = assess(Some(&snapshot), &rules, now) else {
        return Ok(());
    };

    println!("Indexed at:        {}", summary.indexed_at);
    println!("Active approvals:  {}", summary.active_approvals);
    println!(
        "Flagged:           {} (unlimited {}, risky {}, stale {})",
        summary.flagged_approvals, summary.unlimited, summary.risky, summary.stale
    );
    println!("Health score:      {}/100", summary.score);

    let actions = evaluate_all(&snapshot.approvals, &rules, now);
    if actions.is_empty() {
        println!("\nNothing to revoke.");
        return Ok(());
    }

    println!("\nWould revoke:");
    for action in &actions {
        println!(
            "  token {}  spender {}  ({})",
            action.token, action.spender, action.reason
        );
    }
    println!("\nDry run only, nothing was submitted.");

    Ok(())
}

/// Check connectivity to the indexer and the authority provider
pub async fn check(config: &Config) -> Result<()> {
    println!("\n=== CONNECTIVITY CHECK ===\n");

    let mut all_healthy = true;

    print!("Indexer ({})... ", config.indexer.endpoint);
    match HttpIndexer::new(&config.indexer)?.health_check().await {
        Ok(latency) => println!("OK ({}ms)", latency.as_millis()),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Authority provider ({})... ", config.authority.endpoint);
    match HttpAuthority::new(&config.authority)?.health_check().await {
        Ok(latency) => println!("OK ({}ms)", latency.as_millis()),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    println!();
    if all_healthy {
        println!("All endpoints reachable.");
        Ok(())
    } else {
        anyhow::bail!("Some endpoints are unreachable")
    }
}
