//! Node configuration.
//!
//! Layered with the `config` crate: an optional TOML file
//! (`BEACON_NODE_CONFIG`, or `beacon-node.toml` in the working directory),
//! then `BEACON_NODE__*` environment variables. Nested keys use `__`, e.g.
//! `BEACON_NODE__SESSION__INSTANCE_ID=A`.

use anyhow::{Context, Result};
use beacon_core::SessionConfig;
use beacon_transport::RemoteStoreConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "beacon-node.toml";

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// WebSocket URL of the store server.
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// How long to wait for a store reply, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Session settings.
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_store_url() -> String {
    "ws://127.0.0.1:7400/ws".to_string()
}

fn default_request_timeout() -> u64 {
    5_000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            request_timeout_ms: default_request_timeout(),
            session: SessionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load from the config file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or does not deserialize.
    pub fn load() -> Result<Self> {
        let path = std::env::var("BEACON_NODE_CONFIG").ok();
        Self::load_from(path.as_deref())
    }

    /// Load from `path` (or the default file) and environment.
    ///
    /// A missing default file is not an error; a missing explicit one is.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or does not deserialize.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(p) => config::File::with_name(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("BEACON_NODE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load node configuration")?
            .try_deserialize()
            .context("Invalid node configuration")
    }

    /// Connection settings for the remote store.
    #[must_use]
    pub fn remote_store(&self) -> RemoteStoreConfig {
        let mut remote = RemoteStoreConfig::new(self.store_url.clone());
        remote.request_timeout = Duration::from_millis(self.request_timeout_ms);
        remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> NodeConfig {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("");
        assert_eq!(config.store_url, "ws://127.0.0.1:7400/ws");
        assert_eq!(config.request_timeout_ms, 5_000);
        assert_eq!(config.session.service_name, "hotpotato");
        assert_eq!(config.remote_store().request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_session_section() {
        let config = parse(
            r#"
            store_url = "ws://store:7400/ws"

            [session]
            service_name = "relay"
            instance_id = "A"
            initial_holder = true
            handoff_delay_range_ms = [10, 20]
            "#,
        );
        assert_eq!(config.store_url, "ws://store:7400/ws");
        assert_eq!(config.session.service_name, "relay");
        assert_eq!(config.session.instance_id.as_deref(), Some("A"));
        assert!(config.session.initial_holder);
        assert_eq!(config.session.handoff_delay_range_ms, [10, 20]);
        assert_eq!(config.session.ttl_seconds, 10);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        assert!(NodeConfig::load_from(Some("/nonexistent/beacon-node.toml")).is_err());
    }
}
