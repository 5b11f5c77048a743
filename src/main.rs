//! Allowance Sentinel - revokes risky token approvals under delegated authority
//!
//! # WARNING
//! - The agent submits real transactions on behalf of delegating wallets.
//! - Keep the fee ceiling conservative and review abandoned actions.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use allowance_sentinel::cli::commands;
use allowance_sentinel::config::Config;

/// Allowance Sentinel - automated wallet hygiene agent
#[derive(Parser)]
#[command(name = "sentinel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start {
        /// Run the scheduler without the HTTP API
        #[arg(long)]
        no_api: bool,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Evaluate one wallet against the rules without submitting anything
    Scan {
        /// Wallet address
        wallet: String,
    },

    /// Check connectivity to the indexer and authority provider
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    init_tracing(cli.json_logs);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Start { no_api } => commands::start(&config, no_api).await,
        Commands::Config => commands::show_config(&config),
        Commands::Scan { wallet } => commands::scan(&config, &wallet).await,
        Commands::Check => commands::check(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("allowance_sentinel=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.with_file(true).with_line_number(true).init();
    }
}
