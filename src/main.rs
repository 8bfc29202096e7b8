//! Safehold - custodial identity and power-of-attorney node

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use safehold::{
    actions::{token_indexer, ActionLog},
    config::Args,
    gateway::{spawn_reader, TcpGateway},
    node::Node,
    vault::Vault,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("safehold={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Safehold - custodial identity node");
    info!("======================================");
    info!("Vault: {}", args.vault_path.display());
    info!("Action log: {}", args.actions_path.display());
    info!("Gateway: {}", args.gateway_addr);
    info!("======================================");

    // A wrong passphrase or corrupt store is fatal; never serve with
    // partial state.
    let vault = match Vault::open(&args.passphrase, &args.vault_path) {
        Ok(vault) => vault,
        Err(e) => {
            error!("Cannot open vault: {}", e);
            std::process::exit(1);
        }
    };
    info!("Vault open, node token {}", vault.node_token());

    let log = match ActionLog::open(&args.actions_path, Box::new(token_indexer)) {
        Ok(log) => log,
        Err(e) => {
            error!("Cannot open action log: {}", e);
            std::process::exit(1);
        }
    };
    info!("Action log open, {} confirmed action(s)", log.len());

    let (tcp_gateway, read_half) = match TcpGateway::connect(&args.gateway_addr).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("Cannot connect to gateway: {}", e);
            std::process::exit(1);
        }
    };
    info!("Connected to gateway at {}", args.gateway_addr);

    let (handle, block_tx, node_task) = match Node::spawn(vault, log, Arc::new(tcp_gateway)) {
        Ok(parts) => parts,
        Err(e) => {
            error!("Cannot start node: {}", e);
            std::process::exit(1);
        }
    };
    let reader_task = spawn_reader(read_half, block_tx);

    info!("Safehold node running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.shutdown().await;
    match node_task.await {
        Ok(Ok(())) => info!("Node stopped cleanly"),
        Ok(Err(e)) => error!("Node stopped with error: {}", e),
        Err(e) => error!("Node task failed: {}", e),
    }
    reader_task.abort();

    Ok(())
}
