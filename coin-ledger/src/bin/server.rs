//! Coin ledger server binary
//!
//! Usage: `coin-ledger-server [config.toml]`. Without a path, configuration
//! comes from `COIN_LEDGER_*` environment variables.

use anyhow::Context;
use coin_ledger::{Config, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Starting coin ledger server"
    );

    let ledger = Ledger::open(config).await.context("opening ledger")?;
    let stats = ledger.stats()?;
    tracing::info!(
        users = stats.total_users,
        wallets = stats.total_wallets,
        coins = stats.total_coins,
        transactions = stats.total_transactions,
        simulator = ledger.simulator_running(),
        "Ledger ready"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down coin ledger server");
    ledger.shutdown().await.context("shutting down ledger")?;
    Ok(())
}
