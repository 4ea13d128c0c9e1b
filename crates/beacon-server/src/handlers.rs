//! Connection handlers for the store server.
//!
//! Every connection speaks the store wire protocol over binary WebSocket
//! messages. Key/value and publish requests are stateless and go through
//! [`execute`]; subscriptions belong to the connection and are forwarded
//! from the store into the socket by one task per channel.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use beacon_core::{MemoryStore, PresenceStore};
use beacon_protocol::frames::{ERROR_INVALID_FRAME, ERROR_STORE, ERROR_UNKNOWN_REQUEST};
use beacon_protocol::{codec, Frame};
use bytes::{Bytes, BytesMut};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Shared server state.
pub struct AppState {
    /// The hosted store.
    pub store: Arc<MemoryStore>,
    /// Server configuration.
    pub config: Config,
    next_connection: AtomicU64,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store = MemoryStore::new().with_channel_capacity(config.store.channel_capacity);
        Self {
            store: Arc::new(store),
            config,
            next_connection: AtomicU64::new(1),
        }
    }

    fn connection_id(&self) -> String {
        format!("conn_{}", self.next_connection.fetch_add(1, Ordering::Relaxed))
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Beacon store listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    serve(listener, Arc::new(AppState::new(config))).await
}

/// Serve connections on an already bound listener.
///
/// Also runs the expired-key purge loop for as long as the server runs.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let purge = tokio::spawn(purge_loop(
        state.store.clone(),
        Duration::from_millis(state.config.store.purge_interval_ms.max(1)),
    ));

    let app = Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let result = axum::serve(listener, app).await;
    purge.abort();
    result?;
    Ok(())
}

/// Physically remove expired keys on a fixed interval.
async fn purge_loop(store: Arc<MemoryStore>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let purged = store.purge_expired();
        if purged > 0 {
            trace!(purged, "Purged expired keys");
        }
        metrics::set_live_keys(store.len());
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "keys": state.store.len(),
        "channels": state.store.channel_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let limit = state.config.limits.max_message_size;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;

/// Per-connection subscription bookkeeping.
struct Subscriptions {
    tasks: HashMap<String, JoinHandle<()>>,
    tx: mpsc::UnboundedSender<(String, Bytes)>,
    limit: usize,
}

impl Subscriptions {
    fn abort_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = state.connection_id();

    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // All subscription forwarders feed this queue
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<(String, Bytes)>();
    let mut subscriptions = Subscriptions {
        tasks: HashMap::new(),
        tx: sub_tx,
        limit: state.config.limits.max_subscriptions_per_connection,
    };

    'conn: loop {
        tokio::select! {
            biased;

            Some((channel, payload)) = sub_rx.recv() => {
                let frame = Frame::message(channel, payload.to_vec());
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    if let Err(e) = handle_frame(
                                        frame,
                                        &connection_id,
                                        &state,
                                        &mut sender,
                                        &mut subscriptions,
                                    ).await {
                                        error!(connection = %connection_id, error = %e, "Frame handling error");
                                        break 'conn;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Undecodable frame");
                                    metrics::record_error("decode");
                                    read_buffer.clear();
                                    let reply = Frame::error(0, ERROR_INVALID_FRAME, e.to_string());
                                    if send_frame(&mut sender, &reply).await.is_err() {
                                        break 'conn;
                                    }
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(_))) => {
                        metrics::record_error("text_message");
                        let reply = Frame::error(0, ERROR_INVALID_FRAME, "Text messages are not supported");
                        if send_frame(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Dropping the forwarders drops their store subscriptions.
    subscriptions.abort_all();

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    connection_id: &str,
    state: &Arc<AppState>,
    sender: &mut WsSink,
    subscriptions: &mut Subscriptions,
) -> Result<()> {
    let reply = match frame {
        Frame::Subscribe { id, channel } => {
            debug!(connection = %connection_id, channel = %channel, "Subscribe request");
            metrics::record_command("subscribe");
            Some(subscribe(state, subscriptions, id, channel).await)
        }

        Frame::Unsubscribe { id, channel } => {
            debug!(connection = %connection_id, channel = %channel, "Unsubscribe request");
            metrics::record_command("unsubscribe");
            if let Some(handle) = subscriptions.tasks.remove(&channel) {
                handle.abort();
            }
            Some(Frame::ok(id))
        }

        Frame::Pong { .. } => None,

        other => Some(execute(state.store.as_ref(), other).await),
    };

    if let Some(reply) = reply {
        send_frame(sender, &reply).await?;
    }
    Ok(())
}

async fn subscribe(
    state: &Arc<AppState>,
    subscriptions: &mut Subscriptions,
    id: u64,
    channel: String,
) -> Frame {
    if subscriptions.tasks.contains_key(&channel) {
        return Frame::ok(id);
    }
    if subscriptions.tasks.len() >= subscriptions.limit {
        metrics::record_error("subscription_limit");
        return Frame::error(
            id,
            ERROR_STORE,
            format!("Subscription limit reached ({})", subscriptions.limit),
        );
    }

    match state.store.subscribe(&channel).await {
        Ok(mut sub) => {
            let tx = subscriptions.tx.clone();
            let name = channel.clone();
            let handle = tokio::spawn(async move {
                while let Some(payload) = sub.recv().await {
                    if tx.send((name.clone(), payload)).is_err() {
                        break; // Connection gone
                    }
                }
            });
            subscriptions.tasks.insert(channel, handle);
            metrics::record_subscription();
            Frame::ok(id)
        }
        Err(e) => {
            metrics::record_error("store");
            Frame::error(id, ERROR_STORE, e.to_string())
        }
    }
}

/// Execute a stateless request against the store and build its reply.
///
/// Subscriptions are connection state and are not handled here; they and
/// every non-request frame are answered with an error.
pub async fn execute(store: &dyn PresenceStore, frame: Frame) -> Frame {
    let id = frame.request_id().unwrap_or(0);
    let kind = command_kind(&frame);
    metrics::record_command(kind);

    let result = match frame {
        Frame::Set {
            key, value, ttl_ms, ..
        } => store
            .set(&key, Bytes::from(value), Duration::from_millis(ttl_ms))
            .await
            .map(|()| Frame::ok(id)),
        Frame::Get { key, .. } => store.get(&key).await.map(|value| Frame::Value {
            id,
            value: value.map(|v| v.to_vec()),
        }),
        Frame::Scan { prefix, .. } => store
            .scan(&prefix)
            .await
            .map(|keys| Frame::Keys { id, keys }),
        Frame::Del { key, .. } => store.del(&key).await.map(|removed| Frame::Count {
            id,
            count: u64::from(removed),
        }),
        Frame::Publish {
            channel, payload, ..
        } => store
            .publish(&channel, Bytes::from(payload))
            .await
            .map(|receivers| {
                metrics::record_publish(receivers);
                Frame::Count {
                    id,
                    count: receivers as u64,
                }
            }),
        Frame::Ping { timestamp } => Ok(Frame::pong(timestamp)),
        other => {
            metrics::record_error("unknown_request");
            return Frame::error(
                id,
                ERROR_UNKNOWN_REQUEST,
                format!("Unsupported request: {:?}", other.frame_type()),
            );
        }
    };

    result.unwrap_or_else(|e| {
        metrics::record_error("store");
        Frame::error(id, ERROR_STORE, e.to_string())
    })
}

fn command_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Set { .. } => "set",
        Frame::Get { .. } => "get",
        Frame::Scan { .. } => "scan",
        Frame::Del { .. } => "del",
        Frame::Publish { .. } => "publish",
        Frame::Ping { .. } => "ping",
        _ => "other",
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSink, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{Session, SessionConfig, SessionOutcome, SharedStore};
    use beacon_transport::{RemoteStore, RemoteStoreConfig};

    async fn start_server() -> (std::net::SocketAddr, Arc<AppState>) {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state.clone()));
        (addr, state)
    }

    async fn connect(addr: std::net::SocketAddr) -> RemoteStore {
        RemoteStore::connect(RemoteStoreConfig::new(format!("ws://{}/ws", addr)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_key_ops() {
        let store = MemoryStore::new();

        let reply = execute(&store, Frame::set(1, "k", b"v".to_vec(), 60_000)).await;
        assert_eq!(reply, Frame::ok(1));

        let reply = execute(&store, Frame::Get { id: 2, key: "k".into() }).await;
        assert_eq!(reply, Frame::Value { id: 2, value: Some(b"v".to_vec()) });

        let reply = execute(&store, Frame::Scan { id: 3, prefix: "".into() }).await;
        assert_eq!(reply, Frame::Keys { id: 3, keys: vec!["k".into()] });

        let reply = execute(&store, Frame::Del { id: 4, key: "k".into() }).await;
        assert_eq!(reply, Frame::Count { id: 4, count: 1 });

        let reply = execute(&store, Frame::Del { id: 5, key: "k".into() }).await;
        assert_eq!(reply, Frame::Count { id: 5, count: 0 });
    }

    #[tokio::test]
    async fn test_execute_publish_counts_receivers() {
        let store = MemoryStore::new();
        let _a = store.subscribe("inbox").await.unwrap();
        let _b = store.subscribe("inbox").await.unwrap();

        let reply = execute(&store, Frame::publish(9, "inbox", b"x".to_vec())).await;
        assert_eq!(reply, Frame::Count { id: 9, count: 2 });
    }

    #[tokio::test]
    async fn test_execute_store_error() {
        let store = MemoryStore::new();
        store.set_online(false);

        let reply = execute(&store, Frame::Get { id: 7, key: "k".into() }).await;
        assert!(matches!(reply, Frame::Error { id: 7, code, .. } if code == ERROR_STORE));
    }

    #[tokio::test]
    async fn test_execute_rejects_non_requests() {
        let store = MemoryStore::new();

        let reply = execute(&store, Frame::ok(3)).await;
        assert!(matches!(reply, Frame::Error { id: 3, code, .. } if code == ERROR_UNKNOWN_REQUEST));

        let reply = execute(&store, Frame::message("inbox", b"x".to_vec())).await;
        assert!(matches!(reply, Frame::Error { id: 0, code, .. } if code == ERROR_UNKNOWN_REQUEST));

        let reply = execute(&store, Frame::Ping { timestamp: Some(5) }).await;
        assert_eq!(reply, Frame::pong(Some(5)));
    }

    #[tokio::test]
    async fn test_remote_subscription_round_trip() {
        let (addr, state) = start_server().await;
        let client = connect(addr).await;

        let mut sub = client.subscribe("inbox").await.unwrap();
        let receivers = state
            .store
            .publish("inbox", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(receivers, 1);

        let got = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn test_subscriptions_end_with_connection() {
        let (addr, state) = start_server().await;
        let client = connect(addr).await;
        let _sub = client.subscribe("inbox").await.unwrap();
        drop(client);

        // The forwarder drops its store subscription once the connection is gone.
        let mut receivers = 1;
        for _ in 0..50 {
            receivers = state
                .store
                .publish("inbox", Bytes::from_static(b"x"))
                .await
                .unwrap();
            if receivers == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(receivers, 0);
    }

    #[tokio::test]
    async fn test_sessions_over_the_network() {
        let (addr, _state) = start_server().await;

        let mut sessions = Vec::new();
        for (id, holder) in [("A", false), ("B", true)] {
            let store: SharedStore = Arc::new(connect(addr).await);
            let mut config = SessionConfig::new("net");
            config.instance_id = Some(id.to_string());
            config.ttl_seconds = 5;
            config.heartbeat_interval_ms = 500;
            config.handoff_delay_range_ms = [20, 20];
            config.token_ttl_seconds = 1;
            config.initial_holder = holder;
            let session = Session::new(config, store).unwrap();
            sessions.push(session.start().await.unwrap());
        }

        let outcomes = tokio::time::timeout(Duration::from_secs(30), async {
            let mut outcomes = Vec::new();
            for handle in &sessions {
                outcomes.push(handle.terminated().await);
            }
            outcomes
        })
        .await
        .unwrap();

        // Both sides agree on who held the token when it expired.
        let loser = match &outcomes[0] {
            SessionOutcome::Lost { loser } => loser.clone(),
            other => panic!("unexpected outcome: {other}"),
        };
        assert!(loser == "A" || loser == "B");
        assert_eq!(outcomes[1], SessionOutcome::Lost { loser });
    }
}
