//! nowplaying - serve a Last.fm user's recent tracks as cached JSON
//!
//! Reads its configuration from flags or the environment, then serves
//! `GET /recent-tracks` until interrupted.

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nowplaying::cache::SnapshotCache;
use nowplaying::cli::{Cli, ServerConfig};
use nowplaying::data::LastFmClient;
use nowplaying::server;

/// Installs the fmt subscriber; `RUST_LOG` overrides the default `info` level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves when the process receives Ctrl-C
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ServerConfig::from_cli(&cli)?;

    init_tracing();

    let client = LastFmClient::new(&config.api_key, &config.user, config.upstream_timeout)?
        .with_base_url(&config.upstream_url);
    let cache = SnapshotCache::new(client, config.cache_ttl);
    let ttl_secs = cache.ttl().as_secs();
    let app = server::router(cache);

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        listen = %listener.local_addr()?,
        user = %config.user,
        ttl_secs,
        "Server starting"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
