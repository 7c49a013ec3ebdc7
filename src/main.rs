//! Even/Odd Table Server
//!
//! Deploys one table and serves it over WebSocket until Ctrl-C.

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use even_odd::{
    VERSION,
    game::{outcome::CommitRevealDice, table::{Table, TableConfig}},
    network::{AuthConfig, ServerConfig, TableServer, TableService},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Even/Odd Server v{}", VERSION);

    let table_config = TableConfig::from_env();
    let server_config = ServerConfig::from_env();
    let auth_config = AuthConfig::from_env();

    if !auth_config.is_configured() {
        if auth_config.allow_insecure_dev_auth {
            warn!("No auth key configured, trusting claimed subjects (dev only)");
        } else {
            warn!("No auth key configured, every login will be refused");
        }
    }

    info!("Operator: {}", table_config.operator);
    info!("Card validity: {}s", table_config.membership.validity.num_seconds());

    let table = Table::new(table_config, CommitRevealDice::new()).context("failed to deploy table")?;
    let service = TableService::new(table, auth_config);
    let server = std::sync::Arc::new(TableServer::new(server_config, service));

    let running = server.clone();
    let handle = tokio::spawn(async move { running.run().await });

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("Shutting down");
    server.shutdown();

    handle.await.context("server task panicked")??;
    Ok(())
}
