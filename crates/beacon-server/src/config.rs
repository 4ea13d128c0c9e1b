//! Store server configuration.
//!
//! Read from the first TOML file found among `BEACON_CONFIG`, `beacon.toml`,
//! `/etc/beacon/beacon.toml` and `~/.config/beacon/beacon.toml`. Host and
//! port default to `BEACON_HOST` / `BEACON_PORT` when set.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Config files probed when `BEACON_CONFIG` is unset, in order.
const SEARCH_PATHS: [&str; 3] = [
    "beacon.toml",
    "/etc/beacon/beacon.toml",
    "~/.config/beacon/beacon.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen host.
    #[serde(default = "listen_host")]
    pub host: String,

    /// Listen port.
    #[serde(default = "listen_port")]
    pub port: u16,

    /// Route of the WebSocket endpoint.
    #[serde(default = "ws_route")]
    pub websocket_path: String,

    /// Per-connection limits.
    #[serde(default)]
    pub limits: ConnectionLimits,

    /// Hosted store tuning.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Per-connection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionLimits {
    /// Channels one connection may subscribe to at once.
    pub max_subscriptions_per_connection: usize,

    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
}

/// Hosted store tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Interval between expired-key sweeps, in milliseconds.
    pub purge_interval_ms: u64,

    /// Messages buffered per channel before slow subscribers lag.
    pub channel_capacity: usize,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` at all.
    pub enabled: bool,

    /// Exporter port.
    pub port: u16,
}

fn listen_host() -> String {
    std::env::var("BEACON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn listen_port() -> u16 {
    std::env::var("BEACON_PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(7400)
}

fn ws_route() -> String {
    "/ws".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: listen_host(),
            port: listen_port(),
            websocket_path: ws_route(),
            limits: ConnectionLimits::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 64,
            max_message_size: 1024 * 1024,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            purge_interval_ms: 1_000,
            channel_capacity: 1024,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl Config {
    /// Load the first config file found, or defaults if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if `BEACON_CONFIG` names a missing file, or the file
    /// found does not parse.
    pub fn load() -> Result<Self> {
        if let Ok(explicit) = std::env::var("BEACON_CONFIG") {
            return Self::from_file(shellexpand::tilde(&explicit).as_ref());
        }

        let found = SEARCH_PATHS
            .iter()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
            .find(|p| p.exists());

        match found {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse one TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or not a valid config.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Address the server listens on.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse()
            .with_context(|| format!("Invalid bind address {raw}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.websocket_path, "/ws");
        assert_eq!(config.store.purge_interval_ms, 1_000);
        assert_eq!(config.limits.max_subscriptions_per_connection, 64);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 7401,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 7401);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            host = "0.0.0.0"
            port = 7500

            [store]
            purge_interval_ms = 250

            [limits]
            max_subscriptions_per_connection = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7500);
        assert_eq!(config.store.purge_interval_ms, 250);
        assert_eq!(config.store.channel_capacity, 1024);
        assert_eq!(config.limits.max_subscriptions_per_connection, 8);
        assert_eq!(config.limits.max_message_size, 1024 * 1024);
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::from_file("/nonexistent/beacon.toml").is_err());
    }
}
