//! The session state machine.
//!
//! A session drives one instance through its lifetime:
//!
//! ```text
//! Unregistered ─▶ Registering ─▶ Idle ─▶ HoldingToken ◀─▶ WaitingForToken
//!                                   │          │                 │
//!                                   └──────────┴───────┬─────────┘
//!                                                      ▼
//!                                                 Terminated
//! ```
//!
//! Every transition happens on a single actor task. Inbound envelopes,
//! heartbeat results and hand-off timers reach it as events on one mailbox,
//! and the I/O they trigger runs on separate tasks that post their result
//! back.

use crate::clock::{SharedClock, SystemClock};
use crate::config::SessionConfig;
use crate::delivery::{SharedDelivery, StoreDelivery};
use crate::presence::{Keyspace, PresenceDirectory};
use crate::registry::{RegistryClient, RegistryError};
use crate::router::{Router, RouterError};
use crate::store::{SharedStore, StoreError, Subscription};
use beacon_protocol::{decode_envelope, Address, Body, Envelope};
use rand::Rng;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Number of envelope ids remembered for duplicate detection.
const SEEN_CAPACITY: usize = 1024;

/// Body field naming the instance that lost.
pub const BODY_LOSER: &str = "loser";

/// Body field carrying the human-readable result.
pub const BODY_RESULT: &str = "result";

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration is unusable.
    #[error("Invalid session config: {0}")]
    InvalidConfig(String),

    /// Registration failed after every retry.
    #[error("Registration failed: {0}")]
    Registration(#[from] RegistryError),

    /// The inbox could not be subscribed.
    #[error("Inbox subscription failed: {0}")]
    Subscribe(#[source] StoreError),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Not yet started.
    Unregistered,
    /// Writing the first presence record.
    Registering,
    /// Registered, without the token.
    Idle,
    /// Holding the token until the hand-off delay elapses.
    HoldingToken,
    /// Passed the token on.
    WaitingForToken,
    /// Finished. Absorbing.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unregistered => "unregistered",
            SessionState::Registering => "registering",
            SessionState::Idle => "idle",
            SessionState::HoldingToken => "holding_token",
            SessionState::WaitingForToken => "waiting_for_token",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Why a session terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// An instance received an expired token.
    Lost {
        /// The instance that received it.
        loser: String,
    },
    /// The token holder found no other live instance.
    NoPeersAvailable,
    /// Heartbeats kept failing; this instance may no longer be listed.
    PresenceLost,
    /// A termination broadcast arrived without naming a loser.
    Ended {
        /// The result it carried.
        result: String,
    },
    /// The hand-off could not be completed.
    Failed {
        /// Last error seen.
        reason: String,
    },
    /// Shut down by its owner.
    Shutdown,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Lost { loser } => write!(f, "{loser} lost"),
            SessionOutcome::NoPeersAvailable => f.write_str("no peers available"),
            SessionOutcome::PresenceLost => f.write_str("presence lost"),
            SessionOutcome::Ended { result } => f.write_str(result),
            SessionOutcome::Failed { reason } => write!(f, "failed: {reason}"),
            SessionOutcome::Shutdown => f.write_str("shutdown"),
        }
    }
}

impl SessionOutcome {
    /// Read the outcome a termination envelope announces.
    #[must_use]
    pub fn from_termination(envelope: &Envelope) -> Self {
        if let Some(loser) = envelope.body_str(BODY_LOSER) {
            return SessionOutcome::Lost {
                loser: loser.to_string(),
            };
        }
        let result = envelope
            .body_str(BODY_RESULT)
            .map_or_else(|| format!("ended by {}", envelope.from), str::to_string);
        SessionOutcome::Ended { result }
    }
}

type InboundHandler = Box<dyn Fn(&Envelope) + Send + Sync>;
type TerminatedHandler = Box<dyn Fn(&SessionOutcome) + Send + Sync>;

/// Events serialized through the actor mailbox.
enum Event {
    Inbound(Envelope),
    HandoffDue,
    HandoffCompleted(Result<String, RouterError>),
    PresenceLost,
    Shutdown,
}

/// A configured, not yet started session.
pub struct Session {
    config: SessionConfig,
    instance_id: String,
    store: SharedStore,
    clock: SharedClock,
    delivery: Option<SharedDelivery>,
    inbound_handlers: Vec<InboundHandler>,
    terminated_handlers: Vec<TerminatedHandler>,
}

impl Session {
    /// Create a session on `store`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidConfig`] if the config is unusable.
    pub fn new(config: SessionConfig, store: SharedStore) -> Result<Self, SessionError> {
        config.validate().map_err(SessionError::InvalidConfig)?;
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        Ok(Self {
            config,
            instance_id,
            store,
            clock: Arc::new(SystemClock),
            delivery: None,
            inbound_handlers: Vec::new(),
            terminated_handlers: Vec::new(),
        })
    }

    /// Judge presence and token expiry with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Deliver envelopes through `delivery` instead of the store inboxes.
    #[must_use]
    pub fn with_delivery(mut self, delivery: SharedDelivery) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Call `handler` for every new inbound envelope.
    #[must_use]
    pub fn on_inbound_envelope(mut self, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.inbound_handlers.push(Box::new(handler));
        self
    }

    /// Call `handler` once when the session terminates.
    #[must_use]
    pub fn on_terminated(
        mut self,
        handler: impl Fn(&SessionOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.terminated_handlers.push(Box::new(handler));
        self
    }

    /// The id this session registers under.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Subscribe the inbox, register, and start the session tasks.
    ///
    /// The inbox is subscribed before registering so no envelope sent to a
    /// listed instance is missed. Both steps retry with the configured
    /// backoff while the store is unavailable.
    ///
    /// # Errors
    ///
    /// Returns an error if the inbox cannot be subscribed or registration
    /// fails after every retry.
    pub async fn start(self) -> Result<SessionHandle, SessionError> {
        let config = self.config;
        let instance_id = self.instance_id;
        let keyspace = Keyspace::new(&config.namespace);
        let policy = config.registration_policy();
        let (state_tx, state_rx) = watch::channel(SessionState::Unregistered);

        info!(
            service = %config.service_name,
            instance = %instance_id,
            "Starting session"
        );

        let store = &self.store;
        let channel = keyspace.inbox_channel(&instance_id);
        let channel = channel.as_str();
        let inbox = policy
            .run(move || store.subscribe(channel), |_| true)
            .await
            .map_err(SessionError::Subscribe)?;

        state_tx.send_replace(SessionState::Registering);
        let registry = Arc::new(
            RegistryClient::new(self.store.clone(), self.clock.clone(), keyspace.clone())
                .with_max_heartbeat_failures(config.max_heartbeat_failures),
        );
        let (registry_ref, service, id, address, ttl) = (
            &*registry,
            config.service_name.as_str(),
            instance_id.as_str(),
            config.address(),
            config.ttl(),
        );
        policy
            .run(
                move || registry_ref.register(service, id, address.clone(), ttl),
                |e| matches!(e, RegistryError::StoreUnavailable(_)),
            )
            .await?;
        state_tx.send_replace(SessionState::Idle);

        let directory = PresenceDirectory::new(
            self.store.clone(),
            self.clock.clone(),
            keyspace.clone(),
            &instance_id,
        );
        let delivery: SharedDelivery = match self.delivery {
            Some(delivery) => delivery,
            None => Arc::new(StoreDelivery::new(self.store.clone(), keyspace)),
        };
        let router = Router::new(directory, delivery);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let heartbeat = tokio::spawn(heartbeat_loop(
            registry.clone(),
            instance_id.clone(),
            config.heartbeat_interval(),
            events_tx.clone(),
        ));
        let inbox_task = tokio::spawn(inbox_loop(inbox, events_tx.clone()));

        let actor = Actor {
            self_address: Address::instance(&instance_id, &config.service_name, "/"),
            group_address: Address::service(&config.service_name, "/"),
            instance_id: instance_id.clone(),
            config,
            clock: self.clock,
            registry,
            router,
            state: SessionState::Idle,
            state_tx,
            outcome_tx,
            events_tx: events_tx.clone(),
            events_rx,
            seen: SeenIds::new(SEEN_CAPACITY),
            held: None,
            handoff_timer: None,
            handoff_send: None,
            handoff_attempts: 0,
            failed_peers: Vec::new(),
            heartbeat,
            inbox_task,
            inbound_handlers: self.inbound_handlers,
            terminated_handlers: self.terminated_handlers,
        };
        tokio::spawn(actor.run());

        Ok(SessionHandle {
            instance_id,
            events: events_tx,
            state: state_rx,
            outcome: outcome_rx,
        })
    }
}

/// Handle to a running session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    instance_id: String,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<SessionState>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    /// The id the session registered under.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Ask the session to terminate. A no-op once terminated.
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }

    /// Wait for the session to terminate.
    pub async fn terminated(&self) -> SessionOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(SessionOutcome::Shutdown),
            Err(_) => SessionOutcome::Failed {
                reason: "session task ended without an outcome".to_string(),
            },
        };
        outcome
    }
}

/// The token while this instance holds it.
struct HeldToken {
    body: Body,
    expires_at: Option<u64>,
}

/// Bounded memory of processed envelope ids.
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`. Returns `false` if it was already recorded.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

struct Actor {
    config: SessionConfig,
    instance_id: String,
    self_address: Address,
    group_address: Address,
    clock: SharedClock,
    registry: Arc<RegistryClient>,
    router: Router,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    seen: SeenIds,
    held: Option<HeldToken>,
    handoff_timer: Option<JoinHandle<()>>,
    handoff_send: Option<JoinHandle<()>>,
    handoff_attempts: u32,
    /// Peers that failed delivery during the current hold.
    failed_peers: Vec<String>,
    heartbeat: JoinHandle<()>,
    inbox_task: JoinHandle<()>,
    inbound_handlers: Vec<InboundHandler>,
    terminated_handlers: Vec<TerminatedHandler>,
}

impl Actor {
    async fn run(mut self) {
        if self.config.initial_holder {
            let expires_at = self
                .clock
                .now_ms()
                .saturating_add(self.config.token_ttl().as_millis() as u64);
            let mut body = Body::new();
            body.insert("origin".to_string(), Value::from(self.instance_id.clone()));

            info!(instance = %self.instance_id, expires_at, "Starting with the token");
            self.hold(HeldToken {
                body,
                expires_at: Some(expires_at),
            });
        }

        while let Some(event) = self.events_rx.recv().await {
            match event {
                Event::Inbound(envelope) => self.on_inbound(envelope).await,
                Event::HandoffDue => self.on_handoff_due(),
                Event::HandoffCompleted(result) => self.on_handoff_completed(result).await,
                Event::PresenceLost => self.terminate(SessionOutcome::PresenceLost).await,
                Event::Shutdown => self.terminate(SessionOutcome::Shutdown).await,
            }
            if self.state == SessionState::Terminated {
                break;
            }
        }
        debug!(instance = %self.instance_id, "Session actor stopped");
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(instance = %self.instance_id, from = %self.state, to = %state, "State transition");
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    async fn on_inbound(&mut self, envelope: Envelope) {
        if !self.seen.insert(&envelope.id) {
            debug!(instance = %self.instance_id, envelope = %envelope.id, "Discarding duplicate envelope");
            return;
        }
        trace!(
            instance = %self.instance_id,
            envelope = %envelope.id,
            kind = %envelope.message_type,
            from = %envelope.from,
            "Inbound envelope"
        );
        for handler in &self.inbound_handlers {
            handler(&envelope);
        }

        if envelope.message_type == self.config.termination_type {
            self.terminate(SessionOutcome::from_termination(&envelope)).await;
        } else if envelope.message_type == self.config.token_type {
            self.on_token(envelope).await;
        } else {
            trace!(kind = %envelope.message_type, "Ignoring envelope type");
        }
    }

    async fn on_token(&mut self, envelope: Envelope) {
        match self.state {
            SessionState::Idle | SessionState::WaitingForToken | SessionState::HoldingToken => {}
            _ => return,
        }

        // Receiving an expired token loses in every live state, including
        // while another token is held.
        if envelope.is_expired(self.clock.now_ms()) {
            info!(instance = %self.instance_id, from = %envelope.from, "Received expired token");
            self.lose().await;
            return;
        }

        if self.state == SessionState::HoldingToken {
            warn!(
                instance = %self.instance_id,
                envelope = %envelope.id,
                "Already holding the token, discarding"
            );
            return;
        }

        info!(instance = %self.instance_id, from = %envelope.from, "Received token");
        self.hold(HeldToken {
            body: envelope.body,
            expires_at: envelope.expires_at,
        });
    }

    fn hold(&mut self, token: HeldToken) {
        self.held = Some(token);
        self.handoff_attempts = 0;
        self.failed_peers.clear();
        self.set_state(SessionState::HoldingToken);
        self.schedule_handoff();
    }

    fn handoff_delay(&self) -> Duration {
        let [min, max] = self.config.handoff_delay_range_ms;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    fn schedule_handoff(&mut self) {
        let delay = self.handoff_delay();
        let events = self.events_tx.clone();
        debug!(
            instance = %self.instance_id,
            delay_ms = delay.as_millis() as u64,
            "Hand-off scheduled"
        );
        self.handoff_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::HandoffDue);
        }));
    }

    fn on_handoff_due(&mut self) {
        self.handoff_timer = None;
        let Some(token) = &self.held else { return };
        if self.state != SessionState::HoldingToken {
            return;
        }

        let envelope = Envelope::new_at(
            &self.group_address,
            &self.self_address,
            &self.config.token_type,
            token.body.clone(),
            self.clock.now_ms(),
        )
        .with_expires_at(token.expires_at);

        let router = self.router.clone();
        let events = self.events_tx.clone();
        let skip = self.failed_peers.clone();
        self.handoff_send = Some(tokio::spawn(async move {
            let result = router.send_excluding(&envelope, &skip).await;
            let _ = events.send(Event::HandoffCompleted(result));
        }));
    }

    async fn on_handoff_completed(&mut self, result: Result<String, RouterError>) {
        self.handoff_send = None;
        if self.state != SessionState::HoldingToken {
            return;
        }

        match result {
            Ok(peer) => {
                info!(instance = %self.instance_id, to = %peer, "Passed the token");
                self.held = None;
                self.set_state(SessionState::WaitingForToken);
            }
            Err(RouterError::NoPeersAvailable(_)) => {
                self.terminate(SessionOutcome::NoPeersAvailable).await;
            }
            Err(e) if e.is_transient() => {
                self.handoff_attempts += 1;
                if let RouterError::DeliveryFailed { instance, .. } = &e {
                    if !self.failed_peers.contains(instance) {
                        self.failed_peers.push(instance.clone());
                    }
                }
                if self.handoff_attempts >= self.config.handoff_max_attempts {
                    self.terminate(SessionOutcome::Failed {
                        reason: e.to_string(),
                    })
                    .await;
                } else {
                    warn!(
                        instance = %self.instance_id,
                        attempt = self.handoff_attempts,
                        error = %e,
                        "Hand-off failed, retrying"
                    );
                    self.schedule_handoff();
                }
            }
            Err(e) => {
                self.terminate(SessionOutcome::Failed {
                    reason: e.to_string(),
                })
                .await;
            }
        }
    }

    /// Announce this instance as the loser, then terminate.
    async fn lose(&mut self) {
        let outcome = SessionOutcome::Lost {
            loser: self.instance_id.clone(),
        };

        let mut body = Body::new();
        body.insert(BODY_RESULT.to_string(), Value::from(outcome.to_string()));
        body.insert(BODY_LOSER.to_string(), Value::from(self.instance_id.clone()));
        let envelope = Envelope::new_at(
            &self.group_address,
            &self.self_address,
            &self.config.termination_type,
            body,
            self.clock.now_ms(),
        );
        // Our own copy comes back through the inbox.
        self.seen.insert(&envelope.id);

        match self.router.broadcast(&envelope).await {
            Ok(report) => info!(
                instance = %self.instance_id,
                delivered = report.delivered,
                failed = report.failed.len(),
                "Broadcast termination"
            ),
            Err(e) => warn!(instance = %self.instance_id, error = %e, "Termination broadcast failed"),
        }
        self.terminate(outcome).await;
    }

    async fn terminate(&mut self, outcome: SessionOutcome) {
        if self.state == SessionState::Terminated {
            return;
        }

        if let Some(timer) = self.handoff_timer.take() {
            timer.abort();
        }
        if let Some(send) = self.handoff_send.take() {
            send.abort();
        }
        self.heartbeat.abort();
        self.inbox_task.abort();
        self.held = None;
        self.set_state(SessionState::Terminated);

        info!(instance = %self.instance_id, outcome = %outcome, "Session terminated");
        self.registry.deregister(&self.instance_id).await;

        for handler in &self.terminated_handlers {
            handler(&outcome);
        }
        self.outcome_tx.send_replace(Some(outcome));
    }
}

async fn heartbeat_loop(
    registry: Arc<RegistryClient>,
    instance_id: String,
    period: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match registry.heartbeat(&instance_id).await {
            Ok(()) => {}
            Err(RegistryError::StoreUnavailable(_)) => {}
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "Presence lost");
                let _ = events.send(Event::PresenceLost);
                return;
            }
        }
    }
}

async fn inbox_loop(mut inbox: Subscription, events: mpsc::UnboundedSender<Event>) {
    while let Some(payload) = inbox.recv().await {
        match decode_envelope(&payload) {
            Ok(envelope) => {
                if events.send(Event::Inbound(envelope)).is_err() {
                    break;
                }
            }
            Err(e) => warn!(channel = %inbox.channel(), error = %e, "Dropping undecodable envelope"),
        }
    }
    debug!(channel = %inbox.channel(), "Inbox closed");
}
