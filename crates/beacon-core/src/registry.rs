//! Instance registration and heartbeat.
//!
//! A [`RegistryClient`] owns the presence record of one instance. The
//! record is written with an expiry and renewed by heartbeats; if renewals
//! stop the store forgets the instance on its own.

use crate::clock::SharedClock;
use crate::presence::{InstanceAddress, Keyspace, ServiceInstance};
use crate::store::{SharedStore, StoreError};
use beacon_protocol::address::validate_name;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default number of consecutive heartbeat failures tolerated.
pub const DEFAULT_MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No registration is held for this instance.
    #[error("Instance not registered: {0}")]
    NotRegistered(String),

    /// The store rejected the operation.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    /// Too many heartbeats failed in a row; the record must be assumed gone.
    #[error("Presence lost after {failures} consecutive heartbeat failures")]
    PresenceLost {
        /// Consecutive failures observed.
        failures: u32,
    },

    /// The service name or instance id is not addressable.
    #[error("Invalid registration: {0}")]
    Invalid(&'static str),
}

/// Writes and renews one instance's presence record.
pub struct RegistryClient {
    store: SharedStore,
    clock: SharedClock,
    keyspace: Keyspace,
    max_heartbeat_failures: u32,
    registration: Mutex<Option<ServiceInstance>>,
    failures: AtomicU32,
}

impl RegistryClient {
    /// Create a new registry client.
    #[must_use]
    pub fn new(store: SharedStore, clock: SharedClock, keyspace: Keyspace) -> Self {
        Self {
            store,
            clock,
            keyspace,
            max_heartbeat_failures: DEFAULT_MAX_HEARTBEAT_FAILURES,
            registration: Mutex::new(None),
            failures: AtomicU32::new(0),
        }
    }

    /// Set how many consecutive heartbeat failures mean presence is lost.
    #[must_use]
    pub fn with_max_heartbeat_failures(mut self, max: u32) -> Self {
        self.max_heartbeat_failures = max.max(1);
        self
    }

    /// Publish the instance's presence record with an expiry of `ttl`.
    ///
    /// Registering the same instance again refreshes its record and keeps
    /// its original registration time.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::StoreUnavailable`] if the write fails, or
    /// [`RegistryError::Invalid`] if the names are not addressable.
    pub async fn register(
        &self,
        service_name: &str,
        instance_id: &str,
        address: InstanceAddress,
        ttl: Duration,
    ) -> Result<ServiceInstance, RegistryError> {
        validate_name(service_name).map_err(RegistryError::Invalid)?;
        validate_name(instance_id).map_err(RegistryError::Invalid)?;

        let mut registration = self.registration.lock().await;
        let now = self.clock.now_ms();

        let registered_at = registration
            .as_ref()
            .filter(|r| r.instance_id == instance_id && r.service_name == service_name)
            .map_or(now, |r| r.registered_at);

        let instance = ServiceInstance {
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
            address,
            registered_at,
            last_heartbeat: now,
            ttl_ms: ttl.as_millis() as u64,
        };

        self.write(&instance).await?;
        self.failures.store(0, Ordering::SeqCst);
        *registration = Some(instance.clone());

        info!(
            service = %service_name,
            instance = %instance_id,
            ttl_ms = instance.ttl_ms,
            "Registered"
        );
        Ok(instance)
    }

    /// Renew the presence record, extending its expiry by the TTL from now.
    ///
    /// Failures are counted; once the configured number of consecutive
    /// failures is reached the registration is dropped and
    /// [`RegistryError::PresenceLost`] is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if `instance_id` holds no
    /// registration, [`RegistryError::StoreUnavailable`] for a tolerated
    /// failure, or [`RegistryError::PresenceLost`].
    pub async fn heartbeat(&self, instance_id: &str) -> Result<(), RegistryError> {
        let mut registration = self.registration.lock().await;
        let mut instance = match registration.as_ref() {
            Some(r) if r.instance_id == instance_id => r.clone(),
            _ => return Err(RegistryError::NotRegistered(instance_id.to_string())),
        };
        instance.last_heartbeat = self.clock.now_ms();

        match self.write(&instance).await {
            Ok(()) => {
                self.failures.store(0, Ordering::SeqCst);
                *registration = Some(instance);
                debug!(instance = %instance_id, "Heartbeat");
                Ok(())
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    instance = %instance_id,
                    failures,
                    max = self.max_heartbeat_failures,
                    error = %e,
                    "Heartbeat failed"
                );
                if failures >= self.max_heartbeat_failures {
                    *registration = None;
                    Err(RegistryError::PresenceLost { failures })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Remove the presence record immediately.
    ///
    /// Best effort: the TTL removes the record anyway if this fails.
    pub async fn deregister(&self, instance_id: &str) {
        let mut registration = self.registration.lock().await;
        let instance = match registration.take() {
            Some(r) if r.instance_id == instance_id => r,
            other => {
                *registration = other;
                debug!(instance = %instance_id, "Deregister without registration");
                return;
            }
        };

        let key = self
            .keyspace
            .presence_key(&instance.service_name, &instance.instance_id);
        match self.store.del(&key).await {
            Ok(_) => info!(instance = %instance_id, "Deregistered"),
            Err(e) => warn!(instance = %instance_id, error = %e, "Deregister failed"),
        }
    }

    /// The record last written, if registered.
    pub async fn registration(&self) -> Option<ServiceInstance> {
        self.registration.lock().await.clone()
    }

    /// Heartbeat failures since the last successful write.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    async fn write(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let value = serde_json::to_vec(instance)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let key = self
            .keyspace
            .presence_key(&instance.service_name, &instance.instance_id);
        self.store
            .set(&key, Bytes::from(value), Duration::from_millis(instance.ttl_ms))
            .await?;
        Ok(())
    }
}

/// Exponential backoff for operations the caller chooses to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, `retryable` rejects an error, or the
    /// attempts are used up.
    ///
    /// # Errors
    ///
    /// Returns the last error seen.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts.max(1) || !retryable(&e) {
                        return Err(e);
                    }
                    let delay = self.backoff(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
