//! # Beacon Store
//!
//! Shared presence store for Beacon nodes: expiring keys and pub/sub
//! channels served over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! beacon-store
//!
//! # Run with a custom config file
//! BEACON_CONFIG=/path/to/beacon.toml beacon-store
//!
//! # Run with environment variables
//! BEACON_PORT=7400 BEACON_HOST=0.0.0.0 beacon-store
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_store=debug,beacon_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Beacon store on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
