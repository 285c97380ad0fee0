//! Virtlan Relay Server
//!
//! Stands up a relay that hosts rooms, allocates virtual addresses and
//! forwards game frames between room members.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use virtlan::relay::{RelayConfig, RelayServer};
use virtlan::VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config_from_env()?;

    info!("Virtlan Relay v{}", VERSION);
    info!("Listening on {}", config.bind_addr);
    info!("Connection limit: {}", config.max_connections);

    let server = RelayServer::bind(config).await?;
    server.run().await?;
    Ok(())
}

/// Build the relay configuration from environment variables, falling
/// back to defaults for anything unset.
fn config_from_env() -> anyhow::Result<RelayConfig> {
    let mut config = RelayConfig::default();

    if let Ok(addr) = std::env::var("VIRTLAN_ADDR") {
        config.bind_addr = addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid VIRTLAN_ADDR: {addr}"))?;
    }
    if let Ok(max) = std::env::var("VIRTLAN_MAX_CONNS") {
        config.max_connections = max
            .parse::<usize>()
            .with_context(|| format!("invalid VIRTLAN_MAX_CONNS: {max}"))?;
    }
    if let Ok(secs) = std::env::var("VIRTLAN_IDLE_TIMEOUT_SECS") {
        let secs = secs
            .parse::<u64>()
            .with_context(|| format!("invalid VIRTLAN_IDLE_TIMEOUT_SECS: {secs}"))?;
        config.idle_timeout = Duration::from_secs(secs);
    }

    Ok(config)
}
