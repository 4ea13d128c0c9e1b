//! # Beacon Node
//!
//! Runs one session against a remote presence store and prints how it
//! ended.
//!
//! ## Usage
//!
//! ```bash
//! # Join the default service through a local store
//! beacon-node
//!
//! # Start as the token holder
//! BEACON_NODE__SESSION__INSTANCE_ID=A BEACON_NODE__SESSION__INITIAL_HOLDER=true beacon-node
//!
//! # Use a config file
//! BEACON_NODE_CONFIG=/path/to/beacon-node.toml beacon-node
//! ```
//!
//! Exits 0 once the session terminates, whatever the outcome. Fails when the
//! store cannot be reached or initial registration gives up.

mod config;

use anyhow::{Context, Result};
use beacon_core::{Session, SharedStore};
use beacon_transport::RemoteStore;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon_node=info,beacon_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = config::NodeConfig::load()?;

    info!(store = %config.store_url, service = %config.session.service_name, "Starting Beacon node");

    let store = RemoteStore::connect(config.remote_store())
        .await
        .with_context(|| format!("Failed to connect to store at {}", config.store_url))?;
    let store: SharedStore = Arc::new(store);

    let session = Session::new(config.session, store).context("Invalid session configuration")?;
    let handle = session.start().await.context("Failed to start session")?;

    info!(instance = %handle.instance_id(), "Session started");

    let outcome = tokio::select! {
        outcome = handle.terminated() => outcome,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutting down");
            handle.shutdown();
            handle.terminated().await
        }
    };

    info!(instance = %handle.instance_id(), outcome = %outcome, "Session terminated");
    println!("{outcome}");

    Ok(())
}
