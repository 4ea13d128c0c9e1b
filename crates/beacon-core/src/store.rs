//! The presence store abstraction.
//!
//! Beacon keeps no durable state of its own. Presence records and envelope
//! delivery both live in a shared key/value store with expiring keys and a
//! publish/subscribe channel, consumed through [`PresenceStore`].

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store cannot be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The connection to the store was closed.
    #[error("Store connection closed")]
    Closed,

    /// A value could not be encoded or decoded.
    #[error("Store encoding error: {0}")]
    Encoding(String),
}

/// Shared store handle.
pub type SharedStore = Arc<dyn PresenceStore>;

/// A key/value store with expiring keys and pub/sub channels.
///
/// Implementations must be safe to share between every task of a process.
/// No operation may assume exclusive access to the store.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Write `value` under `key`, expiring after `ttl`.
    ///
    /// Overwriting an existing key refreshes its value and expiry.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    /// Read a live key.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// List live keys starting with `prefix`, in first-insertion order.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Delete a key.
    ///
    /// Returns `true` if the key existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Publish a payload on a channel.
    ///
    /// Returns the number of subscribers that received it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

enum Inner {
    Broadcast(broadcast::Receiver<Bytes>),
    Queue(mpsc::UnboundedReceiver<Bytes>),
}

/// A live channel subscription.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    channel: String,
    inner: Inner,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a broadcast receiver.
    #[must_use]
    pub fn from_broadcast(channel: impl Into<String>, rx: broadcast::Receiver<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            inner: Inner::Broadcast(rx),
            on_drop: None,
        }
    }

    /// Wrap a queue fed by a connection task.
    #[must_use]
    pub fn from_queue(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            inner: Inner::Queue(rx),
            on_drop: None,
        }
    }

    /// Run `f` when the subscription is dropped.
    #[must_use]
    pub fn on_drop(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(f));
        self
    }

    /// The subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        match &mut self.inner {
            Inner::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(payload) => return Some(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %self.channel, skipped, "Subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Inner::Queue(rx) => rx.recv().await,
        }
    }

    /// Take the next message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        match &mut self.inner {
            Inner::Broadcast(rx) => loop {
                match rx.try_recv() {
                    Ok(payload) => return Some(payload),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            },
            Inner::Queue(rx) => rx.try_recv().ok(),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}
