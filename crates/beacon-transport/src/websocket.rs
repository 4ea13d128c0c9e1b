//! WebSocket client for a remote presence store.
//!
//! One connection carries every request of the process. Requests are
//! tagged with an id and matched to their reply by a reader task; channel
//! messages pushed by the server are fanned out to local subscriptions.

use async_trait::async_trait;
use beacon_core::{PresenceStore, StoreError, Subscription};
use beacon_protocol::codec::{self, MAX_FRAME_SIZE};
use beacon_protocol::Frame;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

use crate::error::TransportError;

/// Remote store client configuration.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// WebSocket URL of the store server.
    pub url: String,
    /// How long to wait for a reply.
    pub request_timeout: Duration,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl RemoteStoreConfig {
    /// Create a config for `url` with default limits.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:7400/ws".to_string(),
            request_timeout: Duration::from_secs(5),
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

/// A local subscriber of one channel.
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Message>,
    pending: DashMap<u64, oneshot::Sender<Frame>>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
    open: AtomicBool,
    request_timeout: Duration,
    /// Held across a subscribe until the server has acknowledged it.
    subscribe_gate: tokio::sync::Mutex<()>,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let data = codec::encode(frame)?;
        self.outbound
            .send(Message::Binary(data.to_vec()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn request(&self, build: impl FnOnce(u64) -> Frame) -> Result<Frame, TransportError> {
        let (id, rx) = self.queue_request(build)?;
        self.await_reply(id, rx).await
    }

    /// Queue a request and return the receiver for its reply.
    fn queue_request(
        &self,
        build: impl FnOnce(u64) -> Frame,
    ) -> Result<(u64, oneshot::Receiver<Frame>), TransportError> {
        let id = self.next_id();
        let frame = build(id);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.send_frame(&frame) {
            self.pending.remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    async fn await_reply(
        &self,
        id: u64,
        rx: oneshot::Receiver<Frame>,
    ) -> Result<Frame, TransportError> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Frame::Error { code, message, .. })) => {
                Err(TransportError::Remote { code, message })
            }
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                warn!(id, "Request timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Message { channel, payload } => {
                let payload = Bytes::from(payload);
                if let Some(mut subscribers) = self.subscribers.get_mut(&channel) {
                    subscribers.retain(|s| s.tx.send(payload.clone()).is_ok());
                    trace!(channel = %channel, subscribers = subscribers.len(), "Message");
                }
            }
            Frame::Pong { .. } => trace!("Pong"),
            reply if reply.is_reply() => {
                let Some(id) = reply.request_id() else { return };
                match self.pending.remove(&id) {
                    Some((_, tx)) => {
                        let _ = tx.send(reply);
                    }
                    // Late replies to timed-out requests and unsubscribes.
                    None => trace!(id, "Reply without pending request"),
                }
            }
            other => warn!(frame_type = ?other.frame_type(), "Unexpected frame from server"),
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            info!("Store connection closed");
        }
        // Dropping the senders fails pending requests and ends subscriptions.
        self.pending.clear();
        self.subscribers.clear();
    }

    fn unsubscribe(&self, channel: &str, subscriber_id: u64) {
        // Queued under the entry lock, like the subscribe it undoes, so the
        // server sees both in the order they happened here.
        let removed = self.subscribers.remove_if_mut(channel, |_, subscribers| {
            subscribers.retain(|s| s.id != subscriber_id);
            if !subscribers.is_empty() {
                return false;
            }
            let frame = Frame::Unsubscribe {
                id: self.next_id(),
                channel: channel.to_string(),
            };
            if let Err(e) = self.send_frame(&frame) {
                debug!(channel = %channel, error = %e, "Unsubscribe not sent");
            }
            true
        });
        if removed.is_some() {
            debug!(channel = %channel, "Unsubscribed");
        }
    }
}

/// A presence store reached over WebSocket.
pub struct RemoteStore {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteStore {
    /// Connect to a store server.
    ///
    /// # Errors
    ///
    /// Returns an error if the WebSocket handshake fails.
    pub async fn connect(config: RemoteStoreConfig) -> Result<Self, TransportError> {
        let (ws_stream, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(url = %config.url, "Connected to store");

        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let shared = Arc::new(Shared {
            outbound,
            pending: DashMap::new(),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            open: AtomicBool::new(true),
            request_timeout: config.request_timeout,
            subscribe_gate: tokio::sync::Mutex::new(()),
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("Failed to send to store: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_shared = shared.clone();
        let max_message_size = config.max_message_size;
        let reader = tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(4096);

            loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > max_message_size {
                            warn!(
                                "Message too large: {} bytes (max: {})",
                                data.len(),
                                max_message_size
                            );
                            break;
                        }
                        buffer.extend_from_slice(&data);
                        loop {
                            match codec::decode_from(&mut buffer) {
                                Ok(Some(frame)) => reader_shared.dispatch(frame),
                                Ok(None) => break,
                                Err(e) => {
                                    error!("Failed to decode frame: {}", e);
                                    buffer.clear();
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Received close frame");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(WsError::ConnectionClosed)) | None => {
                        debug!("Store connection ended");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            reader_shared.close();
        });

        Ok(Self {
            shared,
            reader,
            writer,
        })
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Send a keepalive ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn ping(&self) -> Result<(), TransportError> {
        self.shared.send_frame(&Frame::ping())
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.shared.close();
        self.reader.abort();
        self.writer.abort();
    }
}

fn unexpected(frame: &Frame) -> StoreError {
    TransportError::UnexpectedReply(frame.frame_type()).into()
}

#[async_trait]
impl PresenceStore for RemoteStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let ttl_ms = ttl.as_millis() as u64;
        match self
            .shared
            .request(|id| Frame::set(id, key, value.to_vec(), ttl_ms))
            .await?
        {
            Frame::Ok { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let reply = self
            .shared
            .request(|id| Frame::Get {
                id,
                key: key.to_string(),
            })
            .await?;
        match reply {
            Frame::Value { value, .. } => Ok(value.map(Bytes::from)),
            other => Err(unexpected(&other)),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let reply = self
            .shared
            .request(|id| Frame::Scan {
                id,
                prefix: prefix.to_string(),
            })
            .await?;
        match reply {
            Frame::Keys { keys, .. } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let reply = self
            .shared
            .request(|id| Frame::Del {
                id,
                key: key.to_string(),
            })
            .await?;
        match reply {
            Frame::Count { count, .. } => Ok(count > 0),
            other => Err(unexpected(&other)),
        }
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
        let reply = self
            .shared
            .request(|id| Frame::publish(id, channel, payload.to_vec()))
            .await?;
        match reply {
            Frame::Count { count, .. } => Ok(count as usize),
            other => Err(unexpected(&other)),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = self.shared.next_id();

        // A later subscriber of the same channel must not return before the
        // server has acknowledged the first one.
        let _gate = self.shared.subscribe_gate.lock().await;

        // Register locally first so nothing pushed after the server's
        // acknowledgement is missed. The server request is queued under the
        // entry lock so it cannot overtake a pending unsubscribe.
        let queued = {
            let mut subscribers = self.shared.subscribers.entry(channel.to_string()).or_default();
            subscribers.push(Subscriber {
                id: subscriber_id,
                tx,
            });
            (subscribers.len() == 1).then(|| {
                self.shared.queue_request(|id| Frame::Subscribe {
                    id,
                    channel: channel.to_string(),
                })
            })
        };

        if let Some(queued) = queued {
            let result = match queued {
                Ok((id, rx)) => self.shared.await_reply(id, rx).await,
                Err(e) => Err(e),
            };
            let result = match result {
                Ok(Frame::Ok { .. }) => Ok(()),
                Ok(other) => Err(unexpected(&other)),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                self.shared.subscribers.remove(channel);
                return Err(e);
            }
            debug!(channel = %channel, "Subscribed");
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let owned_channel = channel.to_string();
        Ok(Subscription::from_queue(channel, rx).on_drop(move || {
            if let Some(shared) = weak.upgrade() {
                shared.unsubscribe(&owned_channel, subscriber_id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::MemoryStore;
    use beacon_protocol::frames::{ERROR_STORE, ERROR_UNKNOWN_REQUEST};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Serve one store over WebSocket for a single test.
    async fn serve(store: Arc<MemoryStore>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = store.clone();
                tokio::spawn(async move {
                    let ws = accept_async(stream).await.unwrap();
                    let (mut sink, mut stream) = ws.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

                    tokio::spawn(async move {
                        while let Some(frame) = rx.recv().await {
                            let data = codec::encode(&frame).unwrap();
                            if sink.send(Message::Binary(data.to_vec())).await.is_err() {
                                break;
                            }
                        }
                    });

                    let mut buffer = BytesMut::new();
                    let mut forwarders = HashMap::new();
                    while let Some(Ok(Message::Binary(data))) = stream.next().await {
                        buffer.extend_from_slice(&data);
                        while let Some(frame) = codec::decode_from(&mut buffer).unwrap() {
                            let reply = answer(&store, frame, &tx, &mut forwarders).await;
                            let _ = tx.send(reply);
                        }
                    }
                    forwarders.values().for_each(JoinHandle::abort);
                });
            }
        });

        addr
    }

    async fn answer(
        store: &MemoryStore,
        frame: Frame,
        push: &mpsc::UnboundedSender<Frame>,
        forwarders: &mut HashMap<String, JoinHandle<()>>,
    ) -> Frame {
        match frame {
            Frame::Set { id, key, value, ttl_ms } => {
                store
                    .set(&key, Bytes::from(value), Duration::from_millis(ttl_ms))
                    .await
                    .unwrap();
                Frame::ok(id)
            }
            Frame::Get { id, key } => Frame::Value {
                id,
                value: store.get(&key).await.unwrap().map(|v| v.to_vec()),
            },
            Frame::Scan { id, prefix } => Frame::Keys {
                id,
                keys: store.scan(&prefix).await.unwrap(),
            },
            Frame::Del { id, key } => Frame::Count {
                id,
                count: u64::from(store.del(&key).await.unwrap()),
            },
            Frame::Publish { id, channel, payload } => Frame::Count {
                id,
                count: store.publish(&channel, Bytes::from(payload)).await.unwrap() as u64,
            },
            Frame::Subscribe { id, channel } if channel.starts_with("denied:") => {
                Frame::error(id, ERROR_STORE, "denied")
            }
            Frame::Subscribe { id, channel } => {
                let mut sub = store.subscribe(&channel).await.unwrap();
                let push = push.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(payload) = sub.recv().await {
                        if push.send(Frame::message(sub.channel(), payload.to_vec())).is_err() {
                            break;
                        }
                    }
                });
                if let Some(previous) = forwarders.insert(channel, forwarder) {
                    previous.abort();
                }
                Frame::ok(id)
            }
            Frame::Unsubscribe { id, channel } => {
                if let Some(forwarder) = forwarders.remove(&channel) {
                    forwarder.abort();
                }
                Frame::ok(id)
            }
            other => Frame::error(
                other.request_id().unwrap_or(0),
                ERROR_UNKNOWN_REQUEST,
                "unsupported",
            ),
        }
    }

    async fn connect(addr: SocketAddr) -> RemoteStore {
        RemoteStore::connect(RemoteStoreConfig::new(format!("ws://{addr}")))
            .await
            .unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = RemoteStoreConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_message_size, MAX_FRAME_SIZE);
    }

    #[tokio::test]
    async fn test_key_operations() {
        let addr = serve(Arc::new(MemoryStore::new())).await;
        let store = connect(addr).await;

        store
            .set("p:a", Bytes::from_static(b"1"), Duration::from_secs(10))
            .await
            .unwrap();
        store
            .set("p:b", Bytes::from_static(b"2"), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(store.get("p:a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert_eq!(store.get("p:z").await.unwrap(), None);
        assert_eq!(store.scan("p:").await.unwrap(), vec!["p:a", "p:b"]);
        assert!(store.del("p:a").await.unwrap());
        assert!(!store.del("p:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_reaches_remote_subscriber() {
        let addr = serve(Arc::new(MemoryStore::new())).await;
        let publisher = connect(addr).await;
        let subscriber = connect(addr).await;

        let mut inbox = subscriber.subscribe("beacon:inbox:b").await.unwrap();
        let receivers = publisher
            .publish("beacon:inbox:b", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(receivers, 1);
        assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_wait_for_acknowledgement() {
        let addr = serve(Arc::new(MemoryStore::new())).await;
        let publisher = connect(addr).await;
        let subscriber = connect(addr).await;

        let (first, (second, receivers)) = tokio::join!(
            subscriber.subscribe("beacon:inbox:b"),
            async {
                let second = subscriber.subscribe("beacon:inbox:b").await.unwrap();
                let receivers = publisher
                    .publish("beacon:inbox:b", Bytes::from_static(b"hello"))
                    .await
                    .unwrap();
                (second, receivers)
            }
        );
        let (mut first, mut second) = (first.unwrap(), second);

        assert_eq!(receivers, 1);
        assert_eq!(first.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(second.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_resubscribe_after_drop() {
        let addr = serve(Arc::new(MemoryStore::new())).await;
        let publisher = connect(addr).await;
        let subscriber = connect(addr).await;

        drop(subscriber.subscribe("beacon:inbox:b").await.unwrap());
        assert!(!subscriber.shared.subscribers.contains_key("beacon:inbox:b"));

        let mut inbox = subscriber.subscribe("beacon:inbox:b").await.unwrap();
        let receivers = publisher
            .publish("beacon:inbox:b", Bytes::from_static(b"again"))
            .await
            .unwrap();

        assert_eq!(receivers, 1);
        assert_eq!(inbox.recv().await.unwrap(), Bytes::from_static(b"again"));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_store_error() {
        let addr = serve(Arc::new(MemoryStore::new())).await;
        let store = connect(addr).await;

        let result = store.subscribe("denied:c").await;
        assert_eq!(
            result.err(),
            Some(StoreError::Unavailable("denied".to_string()))
        );
        assert!(!store.shared.subscribers.contains_key("denied:c"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RemoteStore::connect(RemoteStoreConfig::new(format!("ws://{addr}"))).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_requests_fail_after_close() {
        let addr = serve(Arc::new(MemoryStore::new())).await;
        let store = connect(addr).await;
        store.shared.close();

        assert!(!store.is_open());
        assert_eq!(store.get("k").await, Err(StoreError::Closed));
    }
}
