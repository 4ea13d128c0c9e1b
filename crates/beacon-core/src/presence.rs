//! Presence records and the presence directory.
//!
//! Every running instance keeps one expiring record in the store. The
//! directory lists the live records of a service so routers can pick peers.

use crate::clock::SharedClock;
use crate::store::{SharedStore, StoreError};
use beacon_protocol::Address;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{trace, warn};

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "beacon";

/// Naming scheme for store keys and channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    /// Create a keyspace under `namespace`.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace prefix.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key of one instance's presence record.
    #[must_use]
    pub fn presence_key(&self, service_name: &str, instance_id: &str) -> String {
        format!("{}:presence:{}:{}", self.namespace, service_name, instance_id)
    }

    /// Prefix shared by every presence record of a service.
    #[must_use]
    pub fn presence_prefix(&self, service_name: &str) -> String {
        format!("{}:presence:{}:", self.namespace, service_name)
    }

    /// Pub/sub channel an instance receives envelopes on.
    #[must_use]
    pub fn inbox_channel(&self, instance_id: &str) -> String {
        format!("{}:inbox:{}", self.namespace, instance_id)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

/// Network location an instance advertises.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceAddress {
    /// Host name or IP.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl InstanceAddress {
    /// Create a new address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The presence record of one running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Service group the instance belongs to.
    pub service_name: String,
    /// Process-lifetime unique identity.
    pub instance_id: String,
    /// Advertised location.
    pub address: InstanceAddress,
    /// When the instance first registered (ms since epoch).
    pub registered_at: u64,
    /// Last successful registration or heartbeat (ms since epoch).
    pub last_heartbeat: u64,
    /// Presence time-to-live in milliseconds.
    pub ttl_ms: u64,
}

impl ServiceInstance {
    /// Time at which the record stops counting as present.
    #[must_use]
    pub fn expires_at(&self) -> u64 {
        self.last_heartbeat.saturating_add(self.ttl_ms)
    }

    /// Check if the record has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    /// Address a route on this exact instance.
    #[must_use]
    pub fn route(&self, path: &str) -> Address {
        Address::instance(&self.instance_id, &self.service_name, path)
    }
}

/// Read-only view of the live instances of every service.
#[derive(Clone)]
pub struct PresenceDirectory {
    store: SharedStore,
    clock: SharedClock,
    keyspace: Keyspace,
    self_id: String,
}

impl PresenceDirectory {
    /// Create a directory for the process identified by `self_id`.
    #[must_use]
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        keyspace: Keyspace,
        self_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            keyspace,
            self_id: self_id.into(),
        }
    }

    /// Identity of the current process.
    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// The keyspace the directory reads from.
    #[must_use]
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// List the live instances of a service.
    ///
    /// Instances are ordered by registration time; equal times keep the
    /// store's insertion order. Records whose heartbeat is older than their
    /// TTL are dropped even if the store still holds them. An empty list is
    /// a valid answer.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub async fn list_instances(
        &self,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>, StoreError> {
        let keys = self
            .store
            .scan(&self.keyspace.presence_prefix(service_name))
            .await?;

        let values = join_all(keys.iter().map(|key| self.store.get(key))).await;
        let now = self.clock.now_ms();

        let mut instances = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            // Keys can expire between the scan and the read.
            let Some(bytes) = value? else { continue };

            let instance: ServiceInstance = match serde_json::from_slice(&bytes) {
                Ok(instance) => instance,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping undecodable presence record");
                    continue;
                }
            };

            if instance.service_name != service_name {
                continue;
            }
            if instance.is_expired(now) {
                trace!(instance = %instance.instance_id, "Skipping stale presence record");
                continue;
            }
            instances.push(instance);
        }

        instances.sort_by_key(|i| i.registered_at);
        trace!(service = %service_name, live = instances.len(), "Listed instances");
        Ok(instances)
    }
}
