//! Session configuration.

use crate::presence::{InstanceAddress, DEFAULT_NAMESPACE};
use crate::registry::{RetryPolicy, DEFAULT_MAX_HEARTBEAT_FAILURES};
use beacon_protocol::address::validate_name;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Peer group the instance joins.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Explicit instance id; generated when absent.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Host advertised in the presence record.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port advertised in the presence record.
    #[serde(default)]
    pub port: u16,

    /// Store key namespace.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Presence TTL in seconds.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Heartbeat interval in milliseconds. Must be below the TTL.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Consecutive heartbeat failures before presence counts as lost.
    #[serde(default = "default_max_heartbeat_failures")]
    pub max_heartbeat_failures: u32,

    /// Bounds of the random delay before passing the token on.
    #[serde(default = "default_handoff_delay_range")]
    pub handoff_delay_range_ms: [u64; 2],

    /// Hand-off attempts before the session gives up.
    #[serde(default = "default_handoff_max_attempts")]
    pub handoff_max_attempts: u32,

    /// Envelope type of the passed token.
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Envelope type of the end-of-session broadcast.
    #[serde(default = "default_termination_type")]
    pub termination_type: String,

    /// Lifetime of a freshly created token in seconds.
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,

    /// Start holding the token.
    #[serde(default)]
    pub initial_holder: bool,

    /// Retry of the initial registration.
    #[serde(default)]
    pub registration: RetryConfig,
}

/// Backoff settings for startup retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    /// First backoff in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "hotpotato".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_ttl_seconds() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    3_000
}

fn default_max_heartbeat_failures() -> u32 {
    DEFAULT_MAX_HEARTBEAT_FAILURES
}

fn default_handoff_delay_range() -> [u64; 2] {
    [1_000, 3_000]
}

fn default_handoff_max_attempts() -> u32 {
    3
}

fn default_token_type() -> String {
    "hotpotato".to_string()
}

fn default_termination_type() -> String {
    "gameover".to_string()
}

fn default_token_ttl_seconds() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    5_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            instance_id: None,
            host: default_host(),
            port: 0,
            namespace: default_namespace(),
            ttl_seconds: default_ttl_seconds(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            max_heartbeat_failures: default_max_heartbeat_failures(),
            handoff_delay_range_ms: default_handoff_delay_range(),
            handoff_max_attempts: default_handoff_max_attempts(),
            token_type: default_token_type(),
            termination_type: default_termination_type(),
            token_ttl_seconds: default_token_ttl_seconds(),
            initial_holder: false,
            registration: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl SessionConfig {
    /// Create a config for `service_name` with every other field defaulted.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Check the config for contradictions.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        validate_name(&self.service_name)
            .map_err(|reason| format!("service_name '{}': {reason}", self.service_name))?;
        if let Some(id) = &self.instance_id {
            validate_name(id).map_err(|reason| format!("instance_id '{id}': {reason}"))?;
        }
        validate_name(&self.namespace)
            .map_err(|reason| format!("namespace '{}': {reason}", self.namespace))?;

        if self.ttl_seconds == 0 {
            return Err("ttl_seconds must be positive".to_string());
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval() >= self.ttl() {
            return Err(format!(
                "heartbeat_interval_ms ({}) must be positive and below the TTL ({}s)",
                self.heartbeat_interval_ms, self.ttl_seconds
            ));
        }
        if self.max_heartbeat_failures == 0 {
            return Err("max_heartbeat_failures must be at least 1".to_string());
        }
        let [min, max] = self.handoff_delay_range_ms;
        if min > max {
            return Err(format!("handoff_delay_range_ms [{min}, {max}] is inverted"));
        }
        if self.handoff_max_attempts == 0 {
            return Err("handoff_max_attempts must be at least 1".to_string());
        }
        if self.token_type == self.termination_type {
            return Err("token_type and termination_type must differ".to_string());
        }
        Ok(())
    }

    /// Presence TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Heartbeat period.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Lifetime of a new token.
    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    /// Address advertised in the presence record.
    #[must_use]
    pub fn address(&self) -> InstanceAddress {
        InstanceAddress::new(&self.host, self.port)
    }

    /// Retry policy for registration.
    #[must_use]
    pub fn registration_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.registration)
    }
}
