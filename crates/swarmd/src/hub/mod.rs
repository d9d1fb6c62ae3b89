//! Hub: the supervisor's side of the agent transport.
//!
//! Owns every live connection (one per node id, latest wins), routes typed
//! envelopes to the registry, tracker, pipeline, and dispatcher through
//! the narrow traits below, and runs the heartbeat monitor that drives
//! deterministic offline transitions.

mod conn;
mod handler;
mod origin;

pub use conn::AgentConn;
pub use handler::{ConnIdentity, ws_handler};
pub use origin::origin_allowed;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::SplitStream;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use swarm_protocol::{
    AckPayload, CommandPayload, CommandResultPayload, Envelope, EventPayload, RegisterPayload,
    ReplayRequestPayload, SessionSnapshot, kind,
};

use crate::dispatch::{CommandDispatcher, CommandTransport, TransportError};
use crate::pipeline::{EventPipeline, Signal};
use crate::registry::NodeRegistry;
use crate::tracker::SessionTracker;

/// Per-frame read deadline, reset on every read.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-write deadline on agent connections.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat monitor resolution.
const MONITOR_TICK: Duration = Duration::from_millis(25);

/// Gap flushes run on a multiple of the monitor tick.
const FLUSH_EVERY_TICKS: u32 = 40;

const BROADCAST_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub auth_token: String,
    pub origin_allowlist: Vec<String>,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout_count: u32,
}

impl HubConfig {
    /// A connection with no heartbeat for longer than this is stale.
    pub fn heartbeat_grace(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_timeout_count.max(1)
    }
}

/// Node liveness broadcast on the hub's internal event channel.
#[derive(Debug, Clone)]
pub enum HubEvent {
    NodeOnline { node_id: String },
    NodeOffline { node_id: String },
}

/// Registry capability the hub needs.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn register(&self, node_id: &str, hostname: &str, projects: &[String]) -> Result<()>;
    async fn heartbeat(&self, node_id: &str) -> Result<()>;
    async fn mark_offline(&self, node_id: &str) -> Result<()>;
}

/// Tracker capability the hub needs.
#[async_trait]
pub trait SessionSync: Send + Sync {
    async fn restore_from_snapshot(
        &self,
        node_id: &str,
        sessions: &[SessionSnapshot],
    ) -> Result<()>;
    async fn mark_unreachable(&self, node_id: &str) -> Result<()>;
}

/// Pipeline capability the hub needs.
#[async_trait]
pub trait EventIngest: Send + Sync {
    async fn ingest(&self, node_id: &str, event: EventPayload) -> Result<Vec<Signal>>;
    async fn sync_node(&self, node_id: &str, last_seq: u64) -> Result<()>;
    async fn flush_stale(&self) -> Result<Vec<(String, Vec<Signal>)>>;
}

/// Dispatcher capability the hub needs.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn handle_result(&self, result: CommandResultPayload);
}

/// In-process subscriber for envelope kinds the hub does not consume
/// itself (`credential_sync`, `auth_state`, …).
#[async_trait]
pub trait MessageObserver: Send + Sync {
    async fn observe(&self, node_id: &str, envelope: &Envelope);
}

pub struct Hub {
    config: HubConfig,
    conns: DashMap<String, Arc<AgentConn>>,
    registry: Arc<dyn NodeDirectory>,
    sessions: Arc<dyn SessionSync>,
    events: Arc<dyn EventIngest>,
    results: RwLock<Option<Arc<dyn ResultSink>>>,
    observers: RwLock<Vec<Arc<dyn MessageObserver>>>,
    broadcast: broadcast::Sender<HubEvent>,
    cancel: CancellationToken,
    epochs: AtomicU64,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        registry: Arc<dyn NodeDirectory>,
        sessions: Arc<dyn SessionSync>,
        events: Arc<dyn EventIngest>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (broadcast, _) = broadcast::channel(BROADCAST_BUFFER_SIZE);
        Arc::new(Self {
            config,
            conns: DashMap::new(),
            registry,
            sessions,
            events,
            results: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            broadcast,
            cancel,
            epochs: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Wire the command dispatcher in after construction; the dispatcher
    /// needs the hub first.
    pub fn set_result_sink(&self, sink: Arc<dyn ResultSink>) {
        *self.results.write().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    pub fn add_observer(&self, observer: Arc<dyn MessageObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.broadcast.subscribe()
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.conns.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.conns.contains_key(node_id)
    }

    /// Drop one node's connection; its read loop runs the offline
    /// teardown. Returns false when the node is not connected.
    pub fn disconnect(&self, node_id: &str) -> bool {
        match self.conns.get(node_id) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Test instrumentation: skip the staleness check for one node.
    pub fn pause_heartbeat(&self, node_id: &str, paused: bool) -> bool {
        match self.conns.get(node_id) {
            Some(conn) => {
                conn.pause_heartbeat(paused);
                true
            }
            None => false,
        }
    }

    /// Send a command envelope to one node, correlated by command id.
    pub async fn send(&self, node_id: &str, command: &CommandPayload) -> Result<(), TransportError> {
        let envelope = Envelope::new(kind::COMMAND, command)
            .map_err(|e| TransportError::Send(e.to_string()))?
            .with_request_id(command.command_id.as_str());
        self.send_envelope_to(node_id, &envelope).await
    }

    pub async fn send_envelope_to(
        &self,
        node_id: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let conn = self
            .conns
            .get(node_id)
            .map(|e| e.value().clone())
            .ok_or(TransportError::NodeNotConnected)?;
        conn.send_envelope(envelope).await
    }

    /// The connection task spawned by the upgrade handler.
    pub async fn accept(&self, socket: WebSocket, identity: ConnIdentity) {
        let (sender, receiver) = socket.split();
        let epoch = self.epochs.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Arc::new(AgentConn::new(
            identity.node_id.clone(),
            epoch,
            sender,
            WRITE_TIMEOUT,
        ));

        // Latest wins: displace any previous connection for this node id.
        if let Some(displaced) = self.conns.insert(identity.node_id.clone(), conn.clone()) {
            info!(
                "node {} reconnected; displacing previous connection",
                identity.node_id
            );
            displaced.close();
        }

        if let Err(err) = self
            .registry
            .register(&identity.node_id, &identity.hostname, &identity.projects)
            .await
        {
            warn!("failed to register node {}: {:#}", identity.node_id, err);
        }
        let _ = self.broadcast.send(HubEvent::NodeOnline {
            node_id: identity.node_id.clone(),
        });

        self.read_loop(&conn, receiver).await;
        self.teardown(&conn).await;
    }

    async fn read_loop(&self, conn: &Arc<AgentConn>, mut receiver: SplitStream<WebSocket>) {
        let node_id = conn.node_id().to_string();

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = conn.closed().cancelled() => break,
                frame = tokio::time::timeout(READ_TIMEOUT, receiver.next()) => frame,
            };

            let message = match frame {
                Err(_) => {
                    warn!("node {}: read deadline exceeded", node_id);
                    break;
                }
                Ok(None) => {
                    info!("node {}: connection closed", node_id);
                    break;
                }
                Ok(Some(Err(err))) => {
                    warn!("node {}: read error: {}", node_id, err);
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => self.route(conn, &node_id, text.as_str()).await,
                Message::Close(_) => {
                    info!("node {}: close frame", node_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => debug!("node {}: ignoring binary frame", node_id),
            }
        }
    }

    async fn route(&self, conn: &Arc<AgentConn>, node_id: &str, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("node {}: skipping malformed frame: {}", node_id, err);
                return;
            }
        };

        match envelope.kind.as_str() {
            kind::HEARTBEAT => {
                conn.touch();
                if let Err(err) = self.registry.heartbeat(node_id).await {
                    warn!("heartbeat update for {} failed: {:#}", node_id, err);
                }
            }
            kind::REGISTER => match envelope.payload_as::<RegisterPayload>() {
                Ok(payload) => self.handle_register(node_id, payload).await,
                Err(err) => warn!("node {}: bad register payload: {}", node_id, err),
            },
            kind::EVENT => match envelope.payload_as::<EventPayload>() {
                Ok(event) => self.handle_event(conn, node_id, event).await,
                Err(err) => warn!("node {}: bad event payload: {}", node_id, err),
            },
            kind::COMMAND_RESULT => match envelope.payload_as::<CommandResultPayload>() {
                Ok(result) => {
                    let sink = self
                        .results
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .clone();
                    match sink {
                        Some(sink) => sink.handle_result(result).await,
                        None => warn!("command result with no dispatcher wired"),
                    }
                }
                Err(err) => warn!("node {}: bad command result payload: {}", node_id, err),
            },
            _ => {
                let observers = self
                    .observers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if observers.is_empty() {
                    debug!("node {}: unrouted message kind {}", node_id, envelope.kind);
                }
                for observer in observers {
                    observer.observe(node_id, &envelope).await;
                }
            }
        }
    }

    async fn handle_register(&self, node_id: &str, payload: RegisterPayload) {
        info!(
            "node {} registered: {} sessions, last_seq {}",
            node_id,
            payload.sessions.len(),
            payload.last_seq
        );

        if !payload.hostname.is_empty() {
            if let Err(err) = self.registry.register(node_id, &payload.hostname, &[]).await {
                warn!("failed to refresh node {}: {:#}", node_id, err);
            }
        }
        if let Err(err) = self.events.sync_node(node_id, payload.last_seq).await {
            warn!("failed to sync event cursor for {}: {:#}", node_id, err);
        }
        if let Err(err) = self
            .sessions
            .restore_from_snapshot(node_id, &payload.sessions)
            .await
        {
            warn!("failed to restore snapshot for {}: {:#}", node_id, err);
        }
    }

    async fn handle_event(&self, conn: &Arc<AgentConn>, node_id: &str, event: EventPayload) {
        let signals = match self.events.ingest(node_id, event).await {
            Ok(signals) => signals,
            Err(err) => {
                warn!("event ingest for {} failed: {:#}", node_id, err);
                return;
            }
        };
        self.deliver_signals(conn, node_id, signals).await;
    }

    async fn deliver_signals(&self, conn: &Arc<AgentConn>, node_id: &str, signals: Vec<Signal>) {
        for signal in signals {
            let envelope = match &signal {
                Signal::Ack { seq } => Envelope::new(kind::ACK, &AckPayload { seq: *seq }),
                Signal::Replay {
                    from_seq,
                    to_seq_exclusive,
                } => Envelope::new(
                    kind::REPLAY_REQUEST,
                    &ReplayRequestPayload {
                        node_id: node_id.to_string(),
                        from_seq: *from_seq,
                        to_seq_exclusive: *to_seq_exclusive,
                    },
                ),
            };
            match envelope {
                Ok(envelope) => {
                    if let Err(err) = conn.send_envelope(&envelope).await {
                        warn!("failed to deliver {:?} to {}: {}", signal, node_id, err);
                    }
                }
                Err(err) => warn!("failed to encode {:?}: {}", signal, err),
            }
        }
    }

    /// Connection teardown. Only the connection that still owns the map
    /// entry marks the node offline; a displaced socket exits silently.
    async fn teardown(&self, conn: &Arc<AgentConn>) {
        conn.close();

        let owned = self
            .conns
            .remove_if(conn.node_id(), |_, current| current.epoch() == conn.epoch())
            .is_some();
        if !owned {
            debug!("displaced connection for {} torn down", conn.node_id());
            return;
        }

        let node_id = conn.node_id();
        info!("node {} disconnected", node_id);
        if let Err(err) = self.registry.mark_offline(node_id).await {
            warn!("failed to mark {} offline: {:#}", node_id, err);
        }
        if let Err(err) = self.sessions.mark_unreachable(node_id).await {
            warn!("failed to mark {} sessions unreachable: {:#}", node_id, err);
        }
        let _ = self.broadcast.send(HubEvent::NodeOffline {
            node_id: node_id.to_string(),
        });
    }

    /// Heartbeat monitor: one ticker for every connection. Stale
    /// connections are closed; their read loops then run the offline
    /// teardown path. Also drives the pipeline's stale-gap flush.
    pub fn spawn_monitor(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let hub = self;
        tokio::spawn(async move {
            let grace = hub.config.heartbeat_grace();
            let mut ticker = tokio::time::interval(MONITOR_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks = 0u32;

            loop {
                tokio::select! {
                    _ = hub.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let stale: Vec<Arc<AgentConn>> = hub
                    .conns
                    .iter()
                    .filter(|entry| {
                        !entry.value().is_heartbeat_paused()
                            && entry.value().heartbeat_age() > grace
                    })
                    .map(|entry| entry.value().clone())
                    .collect();
                for conn in stale {
                    warn!(
                        "node {}: no heartbeat for {:?}; closing connection",
                        conn.node_id(),
                        conn.heartbeat_age()
                    );
                    conn.close();
                }

                ticks = ticks.wrapping_add(1);
                if ticks % FLUSH_EVERY_TICKS == 0 {
                    match hub.events.flush_stale().await {
                        Ok(flushed) => {
                            for (node_id, signals) in flushed {
                                if let Some(conn) =
                                    hub.conns.get(&node_id).map(|e| e.value().clone())
                                {
                                    hub.deliver_signals(&conn, &node_id, signals).await;
                                }
                            }
                        }
                        Err(err) => warn!("stale-gap flush failed: {:#}", err),
                    }
                }
            }
        })
    }

    /// Close every connection; used on graceful shutdown.
    pub fn close_all(&self) {
        for entry in self.conns.iter() {
            entry.value().close();
        }
    }
}

// ============================================================================
// Capability wiring for the concrete components
// ============================================================================

#[async_trait]
impl NodeDirectory for NodeRegistry {
    async fn register(&self, node_id: &str, hostname: &str, projects: &[String]) -> Result<()> {
        NodeRegistry::register(self, node_id, hostname, projects).await
    }

    async fn heartbeat(&self, node_id: &str) -> Result<()> {
        NodeRegistry::heartbeat(self, node_id).await
    }

    async fn mark_offline(&self, node_id: &str) -> Result<()> {
        NodeRegistry::mark_offline(self, node_id).await
    }
}

#[async_trait]
impl SessionSync for SessionTracker {
    async fn restore_from_snapshot(
        &self,
        node_id: &str,
        sessions: &[SessionSnapshot],
    ) -> Result<()> {
        SessionTracker::restore_from_snapshot(self, node_id, sessions).await
    }

    async fn mark_unreachable(&self, node_id: &str) -> Result<()> {
        SessionTracker::mark_unreachable(self, node_id).await
    }
}

#[async_trait]
impl EventIngest for EventPipeline {
    async fn ingest(&self, node_id: &str, event: EventPayload) -> Result<Vec<Signal>> {
        EventPipeline::ingest(self, node_id, event).await
    }

    async fn sync_node(&self, node_id: &str, last_seq: u64) -> Result<()> {
        EventPipeline::sync_node(self, node_id, last_seq).await
    }

    async fn flush_stale(&self) -> Result<Vec<(String, Vec<Signal>)>> {
        EventPipeline::flush_stale_gaps(self).await
    }
}

#[async_trait]
impl ResultSink for CommandDispatcher {
    async fn handle_result(&self, result: CommandResultPayload) {
        CommandDispatcher::handle_result(self, result).await
    }
}

#[async_trait]
impl CommandTransport for Hub {
    async fn send_command(
        &self,
        node_id: &str,
        command: &CommandPayload,
    ) -> Result<(), TransportError> {
        self.send(node_id, command).await
    }
}
