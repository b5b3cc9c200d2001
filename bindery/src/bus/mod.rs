//! Pub/sub message bus routing structured messages between agents and clients.
//!
//! The bus is the single source of truth for who is connected. Agents bind a
//! name to their connection via `register`; dashboards stay anonymous. All
//! map mutations serialize through one mutex; delivery is at-most-once with
//! per-connection FIFO ordering and no ordering guarantee across connections.

mod history;

pub use history::MessageHistory;

use crate::errors::BusError;
use crate::protocol::{Message, Payload, Recipient};
use crate::utils::short_id;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default bound on the replay history.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Default per-connection channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for a [`MessageBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum messages retained for replay.
    pub history_limit: usize,
    /// Per-connection outbound queue depth.
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl BusConfig {
    /// Creates a new config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the history limit.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Sets the per-connection channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

/// Delivery counters for observability.
#[derive(Debug, Default)]
pub struct BusMetrics {
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

impl BusMetrics {
    /// Messages successfully handed to a connection queue.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages dropped (full queue or no resolvable target).
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Connections removed after a send found their channel closed.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// A live connection handed back by [`MessageBus::connect`].
///
/// Dropping the receiver is how a peer disconnects implicitly: the next send
/// to it fails and the bus evicts the connection.
#[derive(Debug)]
pub struct BusHandle {
    /// The synthetic client id assigned to this connection.
    pub client_id: String,
    /// The inbound message stream for this connection.
    pub receiver: mpsc::Receiver<Message>,
}

type EventHandler = Arc<dyn Fn(&Message) + Send + Sync>;

struct Connection {
    tx: mpsc::Sender<Message>,
    agent: Option<String>,
}

struct BusState {
    connections: HashMap<String, Connection>,
    /// Agent name -> client id. At most one binding per name; latest wins.
    agents: HashMap<String, String>,
    history: MessageHistory,
    handlers: HashMap<String, Vec<EventHandler>>,
}

/// Pub/sub broker for pipeline events and agent communication.
pub struct MessageBus {
    config: BusConfig,
    state: Mutex<BusState>,
    metrics: BusMetrics,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    /// Creates a bus with the given configuration.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        let history = MessageHistory::new(config.history_limit);
        Self {
            config,
            state: Mutex::new(BusState {
                connections: HashMap::new(),
                agents: HashMap::new(),
                history,
                handlers: HashMap::new(),
            }),
            metrics: BusMetrics::default(),
        }
    }

    /// Accepts a new connection.
    ///
    /// Assigns a synthetic client id and queues a `connected` event carrying
    /// that id and the server time as the connection's first message.
    pub fn connect(&self) -> BusHandle {
        let client_id = short_id("client");
        let (tx, receiver) = mpsc::channel(self.config.channel_capacity);

        let mut welcome = Message::event(
            "connected",
            HashMap::from([
                ("client_id".to_string(), serde_json::json!(client_id)),
                (
                    "server_time".to_string(),
                    serde_json::json!(crate::utils::iso_timestamp()),
                ),
            ]),
        )
        .with_source("bus")
        .to(client_id.clone());
        welcome.assign_server_fields();

        let mut state = self.state.lock();
        state.connections.insert(
            client_id.clone(),
            Connection {
                tx,
                agent: None,
            },
        );
        state.history.push(welcome.clone());
        self.send_locked(&mut state, &client_id, welcome);

        debug!(client_id = %client_id, "Client connected");
        BusHandle {
            client_id,
            receiver,
        }
    }

    /// Binds `agent_name` to the given connection.
    ///
    /// Re-registration rebinds: the previous holder of the name keeps its
    /// connection but stops receiving agent-targeted messages. Replies
    /// `registered` to the caller and broadcasts `agent_connected` to
    /// everyone else.
    pub fn register(&self, client_id: &str, agent_name: &str) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(client_id) {
            return Err(BusError::UnknownClient {
                client_id: client_id.to_string(),
            });
        }

        if let Some(previous) = state.agents.insert(agent_name.to_string(), client_id.to_string()) {
            if previous != client_id {
                if let Some(conn) = state.connections.get_mut(&previous) {
                    conn.agent = None;
                }
                debug!(agent = %agent_name, previous = %previous, "Agent rebound to new connection");
            }
        }
        if let Some(conn) = state.connections.get_mut(client_id) {
            conn.agent = Some(agent_name.to_string());
        }

        let mut reply = Message::response(
            "registered",
            HashMap::from([(
                "agent_name".to_string(),
                serde_json::json!(agent_name),
            )]),
        )
        .with_source("bus")
        .to(client_id.to_string());
        reply.assign_server_fields();
        state.history.push(reply.clone());
        self.send_locked(&mut state, client_id, reply);

        let mut announce = Message::event(
            "agent_connected",
            HashMap::from([(
                "agent_name".to_string(),
                serde_json::json!(agent_name),
            )]),
        )
        .with_source("bus");
        announce.assign_server_fields();
        state.history.push(announce.clone());
        self.fan_out_locked(&mut state, announce, Some(client_id));

        Ok(())
    }

    /// Drops a connection.
    ///
    /// If the connection was a registered agent, unbinds it and broadcasts
    /// `agent_disconnected`; anonymous clients are dropped silently.
    pub fn disconnect(&self, client_id: &str) {
        let mut state = self.state.lock();
        let Some(conn) = state.connections.remove(client_id) else {
            return;
        };

        if let Some(agent_name) = conn.agent {
            // Only unbind if the name still points at this connection.
            if state.agents.get(&agent_name).map(String::as_str) == Some(client_id) {
                state.agents.remove(&agent_name);
                let mut announce = Message::event(
                    "agent_disconnected",
                    HashMap::from([(
                        "agent_name".to_string(),
                        serde_json::json!(agent_name),
                    )]),
                )
                .with_source("bus");
                announce.assign_server_fields();
                state.history.push(announce.clone());
                self.fan_out_locked(&mut state, announce, None);
            }
        }
        debug!(client_id = %client_id, "Client disconnected");
    }

    /// Routes a message to its target.
    ///
    /// Broadcast targets fan out to every connection except the sender.
    /// Named targets resolve agent names first, then client ids; messages to
    /// offline targets are dropped at debug level — delivery is best-effort
    /// by design. Event messages additionally invoke in-process handlers.
    pub fn route(&self, mut message: Message) {
        message.assign_server_fields();

        let handlers = {
            let mut state = self.state.lock();
            state.history.push(message.clone());
            self.handlers_for(&state, &message)
        };
        // Handlers run outside the lock so a handler may call back into
        // the bus without deadlocking.
        for handler in handlers {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(&message);
            })) {
                warn!(event = ?message.event_name(), "Subscription handler panicked: {panic:?}");
            }
        }

        let mut state = self.state.lock();
        match message.target.clone() {
            Recipient::Broadcast => {
                let exclude = Self::resolve_sender(&state, message.source.as_deref());
                self.fan_out_locked(&mut state, message, exclude.as_deref());
            }
            Recipient::Named(name) => {
                if let Some(client_id) = state.agents.get(&name).cloned() {
                    self.send_locked(&mut state, &client_id, message);
                } else if state.connections.contains_key(&name) {
                    self.send_locked(&mut state, &name, message);
                } else {
                    self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(target = %name, "Dropping message for offline target");
                }
            }
        }
    }

    /// Fan-out delivery to all connections, optionally excluding one.
    ///
    /// A send failure on one channel evicts that channel without aborting
    /// delivery to the others.
    pub fn broadcast(&self, mut message: Message, exclude: Option<&str>) {
        message.assign_server_fields();
        let mut state = self.state.lock();
        state.history.push(message.clone());
        self.fan_out_locked(&mut state, message, exclude);
    }

    /// Registers an in-process handler for `event`-typed messages.
    ///
    /// The handler is invoked for every routed event whose name matches.
    /// Panics in handlers are caught and logged, never propagated.
    pub fn subscribe<F>(&self, event_name: impl Into<String>, handler: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        state
            .handlers
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Ingests a raw wire frame from a connection.
    ///
    /// Decodes, stamps the sender, then dispatches: `register` performs the
    /// handshake, `subscribe` is acknowledged, everything else routes. A
    /// frame that fails to decode earns the sender an `error` reply.
    pub fn ingest_json(&self, client_id: &str, raw: &str) -> Result<(), BusError> {
        let mut message = match Message::from_json(raw) {
            Ok(message) => message,
            Err(err) => {
                let mut reply = Message::error(format!("malformed message: {err}"))
                    .with_source("bus")
                    .to(client_id.to_string());
                reply.assign_server_fields();
                let mut state = self.state.lock();
                self.send_locked(&mut state, client_id, reply);
                return Err(BusError::Serialization(err.to_string()));
            }
        };

        if message.source.is_none() {
            let state = self.state.lock();
            let source = state
                .connections
                .get(client_id)
                .and_then(|c| c.agent.clone())
                .unwrap_or_else(|| client_id.to_string());
            message.source = Some(source);
        }

        match &message.payload {
            Payload::Register(register) => {
                let agent_name = register.agent_name.clone();
                self.register(client_id, &agent_name)
            }
            Payload::Subscribe(subscribe) => {
                let mut reply = Message::response(
                    "subscribed",
                    HashMap::from([(
                        "events".to_string(),
                        serde_json::json!(subscribe.events),
                    )]),
                )
                .with_source("bus")
                .to(client_id.to_string());
                reply.assign_server_fields();
                let mut state = self.state.lock();
                self.send_locked(&mut state, client_id, reply);
                Ok(())
            }
            _ => {
                self.route(message);
                Ok(())
            }
        }
    }

    /// Replays the retained history to one connection, oldest first.
    ///
    /// Returns how many messages were queued.
    pub fn replay_to(&self, client_id: &str) -> Result<usize, BusError> {
        let mut state = self.state.lock();
        if !state.connections.contains_key(client_id) {
            return Err(BusError::UnknownClient {
                client_id: client_id.to_string(),
            });
        }
        let snapshot = state.history.snapshot();
        let count = snapshot.len();
        for message in snapshot {
            self.send_locked(&mut state, client_id, message);
        }
        Ok(count)
    }

    /// Returns a snapshot of the message history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.state.lock().history.snapshot()
    }

    /// Returns the names of currently registered agents.
    #[must_use]
    pub fn connected_agents(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state.agents.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of live connections (agents and clients).
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Returns the delivery counters.
    #[must_use]
    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }

    fn handlers_for(&self, state: &BusState, message: &Message) -> Vec<EventHandler> {
        match message.event_name() {
            Some(name) => state.handlers.get(name).cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Maps a message source (agent name or client id) back to a client id.
    fn resolve_sender(state: &BusState, source: Option<&str>) -> Option<String> {
        let source = source?;
        if let Some(client_id) = state.agents.get(source) {
            return Some(client_id.clone());
        }
        if state.connections.contains_key(source) {
            return Some(source.to_string());
        }
        None
    }

    fn fan_out_locked(&self, state: &mut BusState, message: Message, exclude: Option<&str>) {
        let targets: Vec<String> = state
            .connections
            .keys()
            .filter(|id| Some(id.as_str()) != exclude)
            .cloned()
            .collect();
        for client_id in targets {
            self.send_locked(state, &client_id, message.clone());
        }
    }

    /// Queues a message on one connection.
    ///
    /// A full queue drops the message (a slow consumer never blocks the
    /// rest); a closed channel evicts the connection and its agent binding.
    fn send_locked(&self, state: &mut BusState, client_id: &str, message: Message) {
        let Some(conn) = state.connections.get(client_id) else {
            return;
        };
        match conn.tx.try_send(message) {
            Ok(()) => {
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(client_id = %client_id, "Outbound queue full; dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.evicted.fetch_add(1, Ordering::Relaxed);
                if let Some(conn) = state.connections.remove(client_id) {
                    if let Some(agent_name) = conn.agent {
                        if state.agents.get(&agent_name).map(String::as_str) == Some(client_id) {
                            state.agents.remove(&agent_name);
                        }
                    }
                }
                warn!(client_id = %client_id, "Channel closed; connection evicted");
            }
        }
    }
}
