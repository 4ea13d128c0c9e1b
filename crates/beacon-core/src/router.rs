//! Presence-aware envelope routing.
//!
//! The router resolves an envelope's `to` address against the presence
//! directory and hands one copy per chosen instance to a [`Delivery`].
//! It never retries; the caller decides whether a retry changes meaning.

use crate::delivery::{Delivery, DeliveryError, SharedDelivery};
use crate::presence::{PresenceDirectory, ServiceInstance};
use crate::store::StoreError;
use beacon_protocol::{Address, AddressError, Envelope};
use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The destination address does not parse.
    #[error(transparent)]
    MalformedAddress(#[from] AddressError),

    /// No live instance matches a service address.
    #[error("No address resolved for service: {0}")]
    NoAddressResolved(String),

    /// Every live instance of the service is this process.
    #[error("No peers available for service: {0}")]
    NoPeersAvailable(String),

    /// The chosen instance could not be reached.
    #[error("Delivery to {instance} failed: {reason}")]
    DeliveryFailed {
        /// Target instance.
        instance: String,
        /// Underlying failure.
        reason: String,
    },

    /// The presence directory could not be queried.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

impl RouterError {
    /// Check if a later attempt may succeed without changing the request.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RouterError::DeliveryFailed { .. } | RouterError::StoreUnavailable(_)
        )
    }
}

/// Result of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Instances that accepted their copy.
    pub delivered: usize,
    /// Instances whose delivery failed.
    pub failed: Vec<String>,
}

/// Pick the peer a hand-off goes to.
///
/// Candidates are walked in directory order starting just after `self_id`,
/// wrapping around, so every instance passes to its successor in the ring.
/// When `self_id` is not listed the first candidate wins. `self_id` is
/// never returned.
#[must_use]
pub fn select_peer<'a>(
    instances: &'a [ServiceInstance],
    self_id: &str,
) -> Option<&'a ServiceInstance> {
    select_peer_skipping(instances, self_id, &[])
}

/// Like [`select_peer`], but passes over the instances in `skip`.
///
/// If every other instance is in `skip`, falls back to [`select_peer`]:
/// a listed peer is still a peer.
#[must_use]
pub fn select_peer_skipping<'a>(
    instances: &'a [ServiceInstance],
    self_id: &str,
    skip: &[String],
) -> Option<&'a ServiceInstance> {
    let start = instances
        .iter()
        .position(|i| i.instance_id == self_id)
        .map_or(0, |pos| pos + 1);
    let mut ring = instances
        .iter()
        .cycle()
        .skip(start)
        .take(instances.len())
        .filter(|i| i.instance_id != self_id);

    let first = ring.clone().next();
    ring.find(|i| !skip.contains(&i.instance_id)).or(first)
}

/// Routes envelopes to live instances.
#[derive(Clone)]
pub struct Router {
    directory: PresenceDirectory,
    delivery: SharedDelivery,
}

impl Router {
    /// Create a new router.
    #[must_use]
    pub fn new(directory: PresenceDirectory, delivery: SharedDelivery) -> Self {
        Self {
            directory,
            delivery,
        }
    }

    /// The directory used for resolution.
    #[must_use]
    pub fn directory(&self) -> &PresenceDirectory {
        &self.directory
    }

    /// Deliver to the instance `to` names, or to the first live instance
    /// of the service when no instance is named.
    ///
    /// Returns the instance the envelope went to.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoAddressResolved`] when a service address
    /// matches no live instance, or [`RouterError::DeliveryFailed`].
    pub async fn send_direct(&self, envelope: &Envelope) -> Result<String, RouterError> {
        let to = envelope.to_address()?;

        if let Some(instance_id) = &to.instance_id {
            self.deliver(instance_id, envelope).await?;
            return Ok(instance_id.clone());
        }

        let instances = self.directory.list_instances(&to.service_name).await?;
        let target = instances
            .first()
            .ok_or_else(|| RouterError::NoAddressResolved(to.service_name.clone()))?;

        self.deliver(&target.instance_id, &retarget(envelope, &to, &target.instance_id))
            .await?;
        Ok(target.instance_id.clone())
    }

    /// Deliver to one live instance of the service other than this process.
    ///
    /// Presence is queried on every call.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoPeersAvailable`] when no other instance is
    /// live, or [`RouterError::DeliveryFailed`].
    pub async fn send_excluding_self(&self, envelope: &Envelope) -> Result<String, RouterError> {
        self.send_excluding(envelope, &[]).await
    }

    /// [`Router::send_excluding_self`], preferring peers not in `skip`.
    ///
    /// Used to move past a listed peer that just failed delivery.
    ///
    /// # Errors
    ///
    /// Same as [`Router::send_excluding_self`].
    pub async fn send_excluding(
        &self,
        envelope: &Envelope,
        skip: &[String],
    ) -> Result<String, RouterError> {
        let to = envelope.to_address()?;
        let self_id = self.directory.self_id();

        let instances = self.directory.list_instances(&to.service_name).await?;
        let Some(peer) = select_peer_skipping(&instances, self_id, skip) else {
            debug!(service = %to.service_name, "No peers available");
            return Err(RouterError::NoPeersAvailable(to.service_name));
        };

        debug!(
            from = %self_id,
            to = %peer.instance_id,
            candidates = instances.len(),
            skipped = skip.len(),
            "Selected peer"
        );
        self.deliver(&peer.instance_id, &retarget(envelope, &to, &peer.instance_id))
            .await?;
        Ok(peer.instance_id.clone())
    }

    /// Deliver a copy to every live instance of the service, this process
    /// included.
    ///
    /// Failed targets are reported, not retried, and do not stop the rest.
    ///
    /// # Errors
    ///
    /// Returns an error only if the address is malformed or the directory
    /// cannot be queried.
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<BroadcastReport, RouterError> {
        let to = envelope.to_address()?;
        let instances = self.directory.list_instances(&to.service_name).await?;

        let copies: Vec<_> = instances
            .iter()
            .map(|i| (i.instance_id.as_str(), retarget(envelope, &to, &i.instance_id)))
            .collect();
        let results = join_all(
            copies
                .iter()
                .map(|(id, copy)| self.delivery.deliver(id, copy)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for ((instance_id, _), result) in copies.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(instance = %instance_id, error = %e, "Broadcast delivery failed");
                    report.failed.push((*instance_id).to_string());
                }
            }
        }

        debug!(
            service = %to.service_name,
            delivered = report.delivered,
            failed = report.failed.len(),
            "Broadcast"
        );
        Ok(report)
    }

    async fn deliver(&self, instance_id: &str, envelope: &Envelope) -> Result<(), RouterError> {
        trace!(instance = %instance_id, envelope = %envelope.id, "Routing");
        self.delivery
            .deliver(instance_id, envelope)
            .await
            .map_err(|e: DeliveryError| RouterError::DeliveryFailed {
                instance: instance_id.to_string(),
                reason: e.to_string(),
            })
    }
}

fn retarget(envelope: &Envelope, to: &Address, instance_id: &str) -> Envelope {
    let mut copy = envelope.clone();
    copy.to = to.with_instance(instance_id).to_string();
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use crate::presence::{InstanceAddress, Keyspace};
    use crate::registry::RegistryClient;
    use async_trait::async_trait;
    use beacon_protocol::Body;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records deliveries and fails for listed instances.
    #[derive(Default)]
    struct RecordingDelivery {
        sent: Mutex<Vec<(String, Envelope)>>,
        unreachable: Vec<String>,
    }

    impl RecordingDelivery {
        fn targets(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(&self, instance_id: &str, envelope: &Envelope) -> Result<(), DeliveryError> {
            if self.unreachable.iter().any(|u| u == instance_id) {
                return Err(DeliveryError::NoSubscriber(instance_id.to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((instance_id.to_string(), envelope.clone()));
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        registries: Vec<RegistryClient>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(1_000));
            let store = Arc::new(MemoryStore::with_clock(clock.clone()));
            Self {
                clock,
                store,
                registries: Vec::new(),
            }
        }

        async fn register(&mut self, id: &str) {
            let registry =
                RegistryClient::new(self.store.clone(), self.clock.clone(), Keyspace::default());
            registry
                .register("hpp", id, InstanceAddress::new("127.0.0.1", 7000), Duration::from_secs(10))
                .await
                .unwrap();
            self.registries.push(registry);
            self.clock.advance(1);
        }

        fn router(&self, self_id: &str, delivery: Arc<RecordingDelivery>) -> Router {
            let directory = PresenceDirectory::new(
                self.store.clone(),
                self.clock.clone(),
                Keyspace::default(),
                self_id,
            );
            Router::new(directory, delivery)
        }
    }

    fn envelope(to: &str) -> Envelope {
        let mut envelope = Envelope::new(
            &Address::service("hpp", "/"),
            &Address::instance("a", "hpp", "/"),
            "hotpotato",
            Body::new(),
        );
        envelope.to = to.to_string();
        envelope
    }

    fn instances(ids: &[&str]) -> Vec<ServiceInstance> {
        ids.iter()
            .map(|id| ServiceInstance {
                service_name: "hpp".to_string(),
                instance_id: (*id).to_string(),
                address: InstanceAddress::new("127.0.0.1", 7000),
                registered_at: 0,
                last_heartbeat: 0,
                ttl_ms: 10_000,
            })
            .collect()
    }

    fn selected(ids: &[&str], self_id: &str) -> Option<String> {
        select_peer(&instances(ids), self_id).map(|i| i.instance_id.clone())
    }

    #[test]
    fn test_select_peer_ring_successor() {
        assert_eq!(selected(&["a", "b", "c"], "a").as_deref(), Some("b"));
        assert_eq!(selected(&["a", "b", "c"], "b").as_deref(), Some("c"));
        assert_eq!(selected(&["a", "b", "c"], "c").as_deref(), Some("a"));
        assert_eq!(selected(&["a", "b", "c"], "z").as_deref(), Some("a"));
    }

    #[test]
    fn test_select_peer_never_self() {
        for n in 0..6 {
            let ids: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();
            for pos in 0..=n {
                let mut snapshot: Vec<&str> = ids.iter().map(String::as_str).collect();
                snapshot.insert(pos, "me");
                let peer = selected(&snapshot, "me");
                assert_eq!(peer.is_none(), n == 0);
                assert_ne!(peer.as_deref(), Some("me"));
            }
        }
    }

    fn selected_skipping(ids: &[&str], self_id: &str, skip: &[&str]) -> Option<String> {
        let skip: Vec<String> = skip.iter().map(|s| (*s).to_string()).collect();
        select_peer_skipping(&instances(ids), self_id, &skip).map(|i| i.instance_id.clone())
    }

    #[test]
    fn test_select_peer_skipping_moves_along_the_ring() {
        let ids = ["a", "b", "c", "d"];
        assert_eq!(selected_skipping(&ids, "a", &["b"]).as_deref(), Some("c"));
        assert_eq!(selected_skipping(&ids, "a", &["b", "c"]).as_deref(), Some("d"));
        assert_eq!(selected_skipping(&ids, "c", &["d"]).as_deref(), Some("a"));
        // Everyone skipped: back to the plain successor.
        assert_eq!(selected_skipping(&ids, "a", &["b", "c", "d"]).as_deref(), Some("b"));
        assert_eq!(selected_skipping(&["a"], "a", &["b"]), None);
    }

    #[test]
    fn test_select_peer_empty() {
        assert!(selected(&[], "a").is_none());
        assert!(selected(&["a"], "a").is_none());
    }

    #[tokio::test]
    async fn test_send_direct_to_instance() {
        let f = Fixture::new();
        let delivery = Arc::new(RecordingDelivery::default());
        let router = f.router("a", delivery.clone());

        // Named instances skip the directory.
        let id = router.send_direct(&envelope("x@hpp:/")).await.unwrap();
        assert_eq!(id, "x");
        assert_eq!(delivery.targets(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_send_direct_to_service() {
        let mut f = Fixture::new();
        f.register("a").await;
        f.register("b").await;
        let delivery = Arc::new(RecordingDelivery::default());
        let router = f.router("a", delivery.clone());

        assert_eq!(router.send_direct(&envelope("hpp:/ping")).await.unwrap(), "a");
        let sent = delivery.sent.lock().unwrap();
        assert_eq!(sent[0].1.to, "a@hpp:/ping");
    }

    #[tokio::test]
    async fn test_send_direct_unresolved() {
        let f = Fixture::new();
        let router = f.router("a", Arc::new(RecordingDelivery::default()));

        assert!(matches!(
            router.send_direct(&envelope("hpp:/")).await,
            Err(RouterError::NoAddressResolved(s)) if s == "hpp"
        ));
        assert!(matches!(
            router.send_direct(&envelope("hpp")).await,
            Err(RouterError::MalformedAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_send_excluding_self() {
        let mut f = Fixture::new();
        for id in ["a", "b", "c"] {
            f.register(id).await;
        }
        let delivery = Arc::new(RecordingDelivery::default());

        let to = f.router("a", delivery.clone());
        assert_eq!(to.send_excluding_self(&envelope("hpp:/")).await.unwrap(), "b");
        let to = f.router("b", delivery.clone());
        assert_eq!(to.send_excluding_self(&envelope("hpp:/")).await.unwrap(), "c");
        assert_eq!(delivery.targets(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_send_excluding_self_requeries() {
        let mut f = Fixture::new();
        for id in ["a", "b", "c"] {
            f.register(id).await;
        }
        let router = f.router("a", Arc::new(RecordingDelivery::default()));
        assert_eq!(router.send_excluding_self(&envelope("hpp:/")).await.unwrap(), "b");

        f.registries[1].deregister("b").await;
        assert_eq!(router.send_excluding_self(&envelope("hpp:/")).await.unwrap(), "c");
    }

    #[tokio::test]
    async fn test_no_peers_available() {
        let mut f = Fixture::new();
        f.register("a").await;
        let delivery = Arc::new(RecordingDelivery::default());
        let router = f.router("a", delivery.clone());

        assert!(matches!(
            router.send_excluding_self(&envelope("hpp:/")).await,
            Err(RouterError::NoPeersAvailable(s)) if s == "hpp"
        ));
        assert!(delivery.targets().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_reported() {
        let mut f = Fixture::new();
        f.register("a").await;
        f.register("b").await;
        let delivery = Arc::new(RecordingDelivery {
            unreachable: vec!["b".to_string()],
            ..Default::default()
        });
        let router = f.router("a", delivery);

        let err = router.send_excluding_self(&envelope("hpp:/")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, RouterError::DeliveryFailed { instance, .. } if instance == "b"));
    }

    #[tokio::test]
    async fn test_send_excluding_skips_failed_peer() {
        let mut f = Fixture::new();
        for id in ["a", "b", "c"] {
            f.register(id).await;
        }
        let delivery = Arc::new(RecordingDelivery {
            unreachable: vec!["b".to_string()],
            ..Default::default()
        });
        let router = f.router("a", delivery.clone());

        let err = router.send_excluding(&envelope("hpp:/"), &[]).await.unwrap_err();
        assert!(matches!(&err, RouterError::DeliveryFailed { instance, .. } if instance == "b"));

        let sent = router
            .send_excluding(&envelope("hpp:/"), &["b".to_string()])
            .await
            .unwrap();
        assert_eq!(sent, "c");
        assert_eq!(delivery.targets(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_broadcast_includes_self_and_tolerates_failures() {
        let mut f = Fixture::new();
        for id in ["a", "b", "c"] {
            f.register(id).await;
        }
        let delivery = Arc::new(RecordingDelivery {
            unreachable: vec!["b".to_string()],
            ..Default::default()
        });
        let router = f.router("a", delivery.clone());

        let report = router.broadcast(&envelope("hpp:/")).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec!["b"]);
        assert_eq!(delivery.targets(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_broadcast_store_down() {
        let f = Fixture::new();
        f.store.set_online(false);
        let router = f.router("a", Arc::new(RecordingDelivery::default()));

        let err = router.broadcast(&envelope("hpp:/")).await.unwrap_err();
        assert!(matches!(err, RouterError::StoreUnavailable(_)));
    }
}
