use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use opcode_relay::config::RelayConfig;
use opcode_relay::proxy::ProxyServer;
use opcode_relay::session::RelayServices;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Default to INFO level if RUST_LOG is not set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    info!("Starting opcode relay...");

    // Usage: relay [config.yml]
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = RelayConfig::load(config_path.as_deref())?;
    info!(
        protocol = %config.protocol_version,
        definitions = ?config.definitions,
        "Loaded configuration"
    );

    let services = Arc::new(RelayServices::new(config)?);
    let proxy = ProxyServer::bind(services).await?;

    if let Err(e) = proxy.run().await {
        error!("Proxy server error: {}", e);
        return Err(e);
    }

    Ok(())
}
