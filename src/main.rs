//! Huddle conference server binary
//!
//! Binds the six conferencing endpoints and serves until interrupted.
//! Configuration comes from the environment; see `ServerConfig::from_env`.

use tracing::info;
use tracing_subscriber::EnvFilter;

use huddle::{ConferenceServer, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,huddle=debug")),
        )
        .init();

    info!("Starting huddle server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    let server = ConferenceServer::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    server.stop().await;

    Ok(())
}
