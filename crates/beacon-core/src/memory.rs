//! In-process presence store.
//!
//! `MemoryStore` implements [`PresenceStore`] with lock-free maps and tokio
//! broadcast channels. It backs the store server and every test that needs
//! a shared store without a network hop.

use crate::clock::{SharedClock, SystemClock};
use crate::store::{PresenceStore, StoreError, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A stored value with its expiry.
#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    /// Expiry in milliseconds since the epoch.
    expires_at: u64,
    /// First-insertion order, kept across refreshes.
    seq: u64,
}

impl Entry {
    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// An in-memory presence store.
pub struct MemoryStore {
    /// Keys indexed by name.
    keys: DashMap<String, Entry>,
    /// Pub/sub channels indexed by name.
    channels: DashMap<String, broadcast::Sender<Bytes>>,
    clock: SharedClock,
    next_seq: AtomicU64,
    online: AtomicBool,
    channel_capacity: usize,
}

impl MemoryStore {
    /// Create a store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store judging expiry with `clock`.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            keys: DashMap::new(),
            channels: DashMap::new(),
            clock,
            next_seq: AtomicU64::new(0),
            online: AtomicBool::new(true),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the per-channel broadcast capacity for channels created later.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Take the store offline or bring it back.
    ///
    /// While offline every operation fails with [`StoreError::Unavailable`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        debug!(online, "Memory store availability changed");
    }

    /// Check if the store accepts operations.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.keys.iter().filter(|e| e.is_live(now)).count()
    }

    /// Check if the store holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels with at least one subscriber.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.receiver_count() > 0)
            .count()
    }

    /// Physically remove expired keys.
    ///
    /// Returns the number of keys removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.keys.len();
        self.keys.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.keys.len());
        if removed > 0 {
            debug!(removed, "Purged expired keys");
        }
        removed
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_ms();
        let expires_at = now.saturating_add(ttl.as_millis() as u64);

        let mut entry = self.keys.entry(key.to_string()).or_insert_with(|| Entry {
            value: Bytes::new(),
            expires_at: 0,
            seq: 0,
        });
        // New keys and keys that expired before this write both count as a
        // fresh insertion.
        if !entry.is_live(now) {
            entry.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        }
        entry.value = value;
        entry.expires_at = expires_at;

        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "Set key");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_ms();

        let value = self
            .keys
            .get(key)
            .and_then(|e| e.is_live(now).then(|| e.value.clone()));
        if value.is_none() {
            self.keys.remove_if(key, |_, e| !e.is_live(now));
        }
        Ok(value)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_ms();

        let mut live: Vec<(u64, String)> = self
            .keys
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.is_live(now))
            .map(|e| (e.seq, e.key().clone()))
            .collect();
        live.sort_unstable_by_key(|(seq, _)| *seq);

        trace!(prefix = %prefix, matches = live.len(), "Scanned keys");
        Ok(live.into_iter().map(|(_, key)| key).collect())
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_online()?;
        let now = self.clock.now_ms();
        Ok(self
            .keys
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
        self.ensure_online()?;

        let count = self
            .channels
            .get(channel)
            .map(|sender| sender.send(payload).unwrap_or_default())
            .unwrap_or(0);

        if count == 0 {
            self.channels
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
        }
        trace!(channel = %channel, recipients = count, "Published");
        Ok(count)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.ensure_online()?;

        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel, "Creating new channel");
                broadcast::channel(self.channel_capacity).0
            })
            .subscribe();

        Ok(Subscription::from_broadcast(channel, receiver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_set_get_expiry() {
        let (clock, store) = store();
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(9_999);
        assert_eq!(store.get("k").await.unwrap().unwrap(), Bytes::from_static(b"v"));

        clock.advance(1);
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_scan_keeps_insertion_order() {
        let (_clock, store) = store();
        let ttl = Duration::from_secs(10);
        for key in ["p:c", "p:a", "p:b", "other:x"] {
            store.set(key, Bytes::new(), ttl).await.unwrap();
        }
        // Refreshing does not move a key.
        store.set("p:c", Bytes::from_static(b"new"), ttl).await.unwrap();

        assert_eq!(store.scan("p:").await.unwrap(), vec!["p:c", "p:a", "p:b"]);
    }

    #[tokio::test]
    async fn test_expired_key_reinserted_moves_to_end() {
        let (clock, store) = store();
        store.set("p:a", Bytes::new(), Duration::from_secs(1)).await.unwrap();
        store.set("p:b", Bytes::new(), Duration::from_secs(10)).await.unwrap();

        clock.advance(2_000);
        store.set("p:a", Bytes::new(), Duration::from_secs(10)).await.unwrap();

        assert_eq!(store.scan("p:").await.unwrap(), vec!["p:b", "p:a"]);
    }

    #[tokio::test]
    async fn test_del() {
        let (_clock, store) = store();
        store.set("k", Bytes::new(), Duration::from_secs(1)).await.unwrap();
        assert!(store.del("k").await.unwrap());
        assert!(!store.del("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (clock, store) = store();
        store.set("a", Bytes::new(), Duration::from_secs(1)).await.unwrap();
        store.set("b", Bytes::new(), Duration::from_secs(5)).await.unwrap();

        clock.advance(2_000);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let (_clock, store) = store();
        assert_eq!(store.publish("inbox", Bytes::new()).await.unwrap(), 0);

        let mut sub1 = store.subscribe("inbox").await.unwrap();
        let mut sub2 = store.subscribe("inbox").await.unwrap();
        assert_eq!(store.channel_count(), 1);

        let count = store
            .publish("inbox", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(&sub1.recv().await.unwrap()[..], b"hello");
        assert_eq!(&sub2.try_recv().unwrap()[..], b"hello");

        drop(sub1);
        drop(sub2);
        assert_eq!(store.publish("inbox", Bytes::new()).await.unwrap(), 0);
        assert_eq!(store.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_operation() {
        let (_clock, store) = store();
        store.set_online(false);

        assert!(matches!(
            store.set("k", Bytes::new(), Duration::from_secs(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.get("k").await.is_err());
        assert!(store.scan("").await.is_err());
        assert!(store.publish("c", Bytes::new()).await.is_err());
        assert!(store.subscribe("c").await.is_err());

        store.set_online(true);
        assert!(store.scan("").await.unwrap().is_empty());
    }
}
