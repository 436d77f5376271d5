// ABOUTME: DuraChat server binary wiring configuration, store, and providers
// ABOUTME: Starts the WebSocket chat surface and serves until stopped
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # DuraChat Server Binary
//!
//! Boots the streaming chat backend: loads environment configuration,
//! opens the SQLite store, builds the provider registry, and serves the
//! chat WebSocket.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use durachat::chat::ChatOrchestrator;
use durachat::config::ServerConfig;
use durachat::credits::CreditLedger;
use durachat::crypto::ApiKeyCipher;
use durachat::logging::LoggingConfig;
use durachat::providers::{KeyResolver, ProviderRegistry};
use durachat::server::{AnonymousSessions, ChatServer};
use durachat::session::SessionRegistry;
use durachat::store::{BlobStore, ChatStore, SqliteStore};

#[derive(Parser)]
#[command(name = "durachat-server")]
#[command(about = "DuraChat - streaming AI chat backend with credit metering")]
struct Args {
    /// Override HTTP port
    #[arg(long)]
    http_port: Option<u16>,

    /// Override database URL
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::from_env()?;
    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }

    LoggingConfig::from_env().init()?;
    info!("Starting DuraChat server");

    let sqlite = SqliteStore::connect(&config.database_url).await?;
    let store: Arc<dyn ChatStore> = Arc::new(sqlite.clone());
    let blobs: Arc<dyn BlobStore> = Arc::new(sqlite);

    let registry = Arc::new(ProviderRegistry::standard());
    let cipher = ApiKeyCipher::new(config.encryption_master_key);
    let resolver = Arc::new(KeyResolver::new(
        cipher,
        Arc::clone(&store),
        config.system_keys.clone(),
    ));
    let credits = Arc::new(CreditLedger::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        config.billing.clone(),
    ));
    let sessions = Arc::new(SessionRegistry::new());

    let orchestrator = Arc::new(ChatOrchestrator::new(
        Arc::clone(&store),
        blobs,
        registry,
        resolver,
        credits,
        Arc::clone(&sessions),
        config.billing.clone(),
        config.streaming.clone(),
    ));

    let server = Arc::new(ChatServer::new(
        orchestrator,
        sessions,
        store,
        Arc::new(AnonymousSessions),
    ));

    server.serve(config.http_port).await?;
    Ok(())
}
