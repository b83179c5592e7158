//! CLI entry point for chatstream.
//!
//! Provides the `chatstream` command: `serve` wires the broker, store,
//! processor, and gateway together and starts the server; `config` prints
//! the resolved configuration.

mod cli;
mod config;
mod demo;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use chatstream_broker::{EventPublisher, MemoryBroker};
use chatstream_gateway::{AppState, GatewayConfig, GatewayServer, SessionManager};
use chatstream_processor::{EventProcessor, EventSource, ResponseCoordinator};
use chatstream_store::{Database, MemoryKvStore, MessageRepository};

use crate::cli::{Cli, Commands};
use crate::config::{init_tracing, load_config};
use crate::demo::DemoSource;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing).
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, port, config } => cmd_serve(bind, port, &config).await,
        Commands::Config { config } => cmd_config(&config),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_serve(bind: Option<String>, port: Option<u16>, config_path: &str) -> Result<()> {
    init_tracing("info");

    let config = load_config(config_path)?;
    let gateway_config = GatewayConfig {
        bind_addr: bind.unwrap_or(config.server.bind),
        port: port.unwrap_or(config.server.port),
    };

    let db = Database::open(&config.store.db_path)
        .with_context(|| format!("opening message store at {}", config.store.db_path))?;
    let repository = MessageRepository::new(db);

    let broker = Arc::new(MemoryBroker::new());
    let kv = Arc::new(MemoryKvStore::new());

    let processor = Arc::new(EventProcessor::new(EventPublisher::new(broker.clone())));
    let coordinator = Arc::new(ResponseCoordinator::new(processor, repository.clone()));
    let sessions = Arc::new(SessionManager::new(kv, broker));
    let source: Arc<dyn EventSource> = Arc::new(DemoSource::new());

    let state = Arc::new(AppState {
        sessions,
        coordinator,
        source,
        repository,
        config: gateway_config.clone(),
    });

    info!(
        bind = %gateway_config.bind_addr,
        port = gateway_config.port,
        db_path = %config.store.db_path,
        "chatstream starting"
    );

    GatewayServer::new(gateway_config, state)
        .start()
        .await
        .map_err(|err| anyhow::anyhow!(err))
}

fn cmd_config(config_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
