//! The agent's long-lived channel to the supervisor.
//!
//! One logical connection, re-dialed forever through a jittered backoff.
//! Every (re)connect replays the same sequence: register snapshot, resend
//! of unacknowledged events in order, then the on-connect hooks. Events get
//! a per-lifetime monotone sequence and stay in the pending buffer until
//! the supervisor's cumulative ack covers them.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use swarm_protocol::{
    AckPayload, CommandKind, CommandPayload, CommandResultPayload, Envelope, EventPayload,
    HeartbeatPayload, RegisterPayload, ReplayRequestPayload, kind,
};

use crate::backoff::{Backoff, BackoffConfig};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection parameters for the supervisor link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Supervisor WebSocket URL, e.g. `ws://host:9190/ws/agent`.
    pub url: String,
    pub auth_token: String,
    pub node_id: String,
    pub projects: Vec<String>,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl LinkConfig {
    pub fn new(
        url: impl Into<String>,
        auth_token: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            auth_token: auth_token.into(),
            node_id: node_id.into(),
            projects: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_projects(mut self, projects: Vec<String>) -> Self {
        self.projects = projects;
        self
    }
}

/// Handles one decoded command. Registered per command type.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: CommandPayload) -> CommandResultPayload;
}

/// Fallback for envelope kinds the link does not route itself.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

/// Runs after every successful (re)connect, in registration order. The
/// first hook error aborts the connection.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connect(&self, link: &AgentLink) -> Result<()>;
}

/// Supplies the register snapshot body; the link fills in `last_seq`.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot_payload(&self) -> RegisterPayload;
}

/// Events sent but not yet covered by a cumulative ack, in seq order.
#[derive(Debug, Default)]
struct PendingBuffer {
    entries: VecDeque<(u64, Envelope)>,
    last_acked: u64,
}

impl PendingBuffer {
    fn push(&mut self, seq: u64, envelope: Envelope) {
        self.entries.push_back((seq, envelope));
    }

    fn ack(&mut self, seq: u64) {
        if seq > self.last_acked {
            self.last_acked = seq;
        }
        while let Some((front_seq, _)) = self.entries.front() {
            if *front_seq <= seq {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn all(&self) -> Vec<Envelope> {
        self.entries.iter().map(|(_, e)| e.clone()).collect()
    }

    fn range(&self, from: u64, to_exclusive: u64) -> Vec<Envelope> {
        self.entries
            .iter()
            .filter(|(seq, _)| *seq >= from && *seq < to_exclusive)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn oldest_retained(&self) -> Option<u64> {
        self.entries.front().map(|(seq, _)| *seq)
    }
}

/// The agent side of the agent↔supervisor transport.
pub struct AgentLink {
    config: LinkConfig,
    backoff: Backoff,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    pending: Mutex<PendingBuffer>,
    next_seq: AtomicU64,
    handlers: RwLock<HashMap<CommandKind, Arc<dyn CommandHandler>>>,
    message_handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    hooks: RwLock<Vec<Arc<dyn ConnectHook>>>,
    snapshots: RwLock<Option<Arc<dyn SnapshotProvider>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    snapshot_calls: AtomicU64,
}

impl AgentLink {
    pub fn new(config: LinkConfig) -> Arc<Self> {
        Self::with_backoff(config, BackoffConfig::default())
    }

    pub fn with_backoff(config: LinkConfig, backoff: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            backoff: Backoff::new(backoff),
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(PendingBuffer::default()),
            next_seq: AtomicU64::new(0),
            handlers: RwLock::new(HashMap::new()),
            message_handler: RwLock::new(None),
            hooks: RwLock::new(Vec::new()),
            snapshots: RwLock::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            connected: AtomicBool::new(false),
            snapshot_calls: AtomicU64::new(0),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn register_command_handler(&self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, handler);
    }

    pub fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self
            .message_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn add_connect_hook(&self, hook: Arc<dyn ConnectHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn set_snapshot_provider(&self, provider: Arc<dyn SnapshotProvider>) {
        *self.snapshots.write().unwrap_or_else(|e| e.into_inner()) = Some(provider);
    }

    /// Start the reconnect loop. Non-blocking; no-op when already started.
    pub fn connect(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let link = Arc::clone(self);
        *task = Some(tokio::spawn(run_loop(link)));
    }

    /// Cancel the loop, tear down the socket, and wait for loop exit.
    /// Idempotent; further sends are refused afterwards.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Send one envelope over the live socket. Serialized through the send
    /// lock; honors the write deadline; fails when disconnected.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let text = envelope.encode().context("encoding envelope")?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or_else(|| anyhow!("not connected"))?;

        match tokio::time::timeout(
            self.config.write_timeout,
            sink.send(Message::Text(text.into())),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(anyhow!("write failed: {}", err)),
            Err(_) => Err(anyhow!("write deadline exceeded")),
        }
    }

    /// Assign the next sequence, enqueue for resend, then try to send.
    /// The event is eligible for reconnect resend even when the immediate
    /// send fails, because the buffer append happens first.
    pub async fn send_event(
        &self,
        session_id: Option<String>,
        event_kind: &str,
        data: Value,
    ) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let payload = EventPayload {
            id: EventPayload::event_id(&self.config.node_id, seq),
            session_id,
            kind: event_kind.to_string(),
            data,
            timestamp: swarm_protocol::unix_now(),
            seq,
        };
        let envelope = Envelope::new(kind::EVENT, &payload)?;

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(seq, envelope.clone());

        if let Err(err) = self.send_envelope(envelope).await {
            debug!("event seq {} held for resend: {}", seq, err);
        }
        Ok(seq)
    }

    /// Advance the cumulative ack watermark and prune the buffer.
    pub fn acknowledge_seq(&self, seq: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ack(seq);
    }

    pub fn last_acked_seq(&self) -> u64 {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_acked
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// How many times the snapshot provider has been consulted.
    pub fn snapshot_calls(&self) -> u64 {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    fn dial_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut url = self.config.url.clone();
        if !self.config.projects.is_empty() {
            let separator = if url.contains('?') { '&' } else { '?' };
            url.push(separator);
            url.push_str("projects=");
            url.push_str(&self.config.projects.join(","));
        }

        let mut request = url
            .into_client_request()
            .context("building dial request")?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.auth_token))
            .context("auth token is not a valid header value")?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        let node_id = HeaderValue::from_str(&self.config.node_id)
            .context("node id is not a valid header value")?;
        request.headers_mut().insert("X-Node-ID", node_id);
        Ok(request)
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = sink.close().await;
        }
    }
}

async fn run_loop(link: Arc<AgentLink>) {
    loop {
        if link.cancel.is_cancelled() {
            break;
        }

        let socket = match dial(&link).await {
            Ok(socket) => socket,
            Err(err) => {
                let delay = link.backoff.duration();
                warn!(
                    "dial {} failed: {}; retrying in {:?}",
                    link.config.url, err, delay
                );
                tokio::select! {
                    _ = link.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        let (sink, mut source) = socket.split();
        *link.writer.lock().await = Some(sink);

        if let Err(err) = establish(&link).await {
            let delay = link.backoff.duration();
            warn!("connection setup failed: {}; retrying in {:?}", err, delay);
            link.teardown().await;
            tokio::select! {
                _ = link.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            continue;
        }

        // Entered running: this is the only place the backoff resets.
        link.backoff.reset();
        link.connected.store(true, Ordering::SeqCst);
        info!("connected to supervisor as {}", link.config.node_id);

        let cancelled = read_loop(&link, &mut source).await;
        link.teardown().await;
        if cancelled {
            break;
        }
    }

    link.teardown().await;
    debug!("agent link loop exited");
}

async fn dial(link: &Arc<AgentLink>) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let request = link.dial_request()?;
    let (socket, _response) = tokio::time::timeout(
        link.config.handshake_timeout,
        connect_async(request),
    )
    .await
    .map_err(|_| anyhow!("handshake deadline exceeded"))?
    .context("websocket handshake")?;
    Ok(socket)
}

/// Register, resend the pending buffer, then run the hooks.
async fn establish(link: &Arc<AgentLink>) -> Result<()> {
    let provider = link
        .snapshots
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let mut payload = match provider {
        Some(provider) => {
            link.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            provider.snapshot_payload().await
        }
        None => RegisterPayload::default(),
    };
    payload.last_seq = link.next_seq.load(Ordering::SeqCst);

    let register = Envelope::new(kind::REGISTER, &payload)?;
    link.send_envelope(register).await.context("sending register")?;

    let pending = link
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .all();
    if !pending.is_empty() {
        info!("resending {} buffered events", pending.len());
    }
    for envelope in pending {
        link.send_envelope(envelope).await.context("resending event")?;
    }

    let hooks = link.hooks.read().unwrap_or_else(|e| e.into_inner()).clone();
    for hook in hooks {
        hook.on_connect(link).await.context("on-connect hook")?;
    }
    Ok(())
}

/// Returns true when the loop ended due to cancellation.
async fn read_loop(link: &Arc<AgentLink>, source: &mut WsSource) -> bool {
    loop {
        let frame = tokio::select! {
            _ = link.cancel.cancelled() => return true,
            frame = tokio::time::timeout(link.config.read_timeout, source.next()) => frame,
        };

        let message = match frame {
            Err(_) => {
                warn!("read deadline exceeded; reconnecting");
                return false;
            }
            Ok(None) => {
                info!("supervisor closed the connection");
                return false;
            }
            Ok(Some(Err(err))) => {
                warn!("read error: {}; reconnecting", err);
                return false;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => route_frame(link, text.as_str()).await,
            Message::Close(_) => {
                info!("supervisor sent close");
                return false;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => debug!("ignoring binary frame"),
            Message::Frame(_) => {}
        }
    }
}

async fn route_frame(link: &Arc<AgentLink>, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("skipping malformed frame: {}", err);
            return;
        }
    };

    match envelope.kind.as_str() {
        kind::COMMAND => dispatch_command(link, envelope),
        kind::ACK => match envelope.payload_as::<AckPayload>() {
            Ok(ack) => link.acknowledge_seq(ack.seq),
            Err(err) => warn!("bad ack payload: {}", err),
        },
        kind::REPLAY_REQUEST => match envelope.payload_as::<ReplayRequestPayload>() {
            Ok(request) => replay_range(link, request),
            Err(err) => warn!("bad replay request payload: {}", err),
        },
        _ => {
            let handler = link
                .message_handler
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            match handler {
                Some(handler) => handler.handle(envelope).await,
                None => debug!("no handler for message kind {}", envelope.kind),
            }
        }
    }
}

/// Shape used to salvage a command id out of a payload that fails full
/// decoding, so the supervisor still gets a typed failure.
#[derive(Debug, Deserialize)]
struct RawCommandHeader {
    #[serde(default)]
    command_id: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

fn dispatch_command(link: &Arc<AgentLink>, envelope: Envelope) {
    let command = match envelope.payload_as::<CommandPayload>() {
        Ok(command) => command,
        Err(err) => {
            let header: Option<RawCommandHeader> = envelope.payload_as().ok();
            let command_id = header
                .as_ref()
                .and_then(|h| h.command_id.clone())
                .or_else(|| envelope.request_id.clone());
            let kind_name = header
                .and_then(|h| h.kind)
                .unwrap_or_else(|| "<missing>".to_string());
            warn!("undecodable command payload (type {}): {}", kind_name, err);

            if let Some(command_id) = command_id {
                let result = CommandResultPayload::failure(
                    &command_id,
                    format!("unknown or malformed command type: {}", kind_name),
                );
                send_result(link, result);
            }
            return;
        }
    };

    let handler = link
        .handlers
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(&command.kind)
        .cloned();

    let link = Arc::clone(link);
    tokio::spawn(async move {
        let command_id = command.command_id.clone();
        let result = match handler {
            Some(handler) => handler.handle(command).await,
            None => CommandResultPayload::failure(
                &command_id,
                format!("no handler registered for {}", command.kind),
            ),
        };
        send_result(&link, result);
    });
}

fn send_result(link: &Arc<AgentLink>, result: CommandResultPayload) {
    let link = Arc::clone(link);
    tokio::spawn(async move {
        let envelope = match Envelope::new(kind::COMMAND_RESULT, &result) {
            Ok(envelope) => envelope.with_request_id(result.command_id.as_str()),
            Err(err) => {
                warn!("failed to encode command result: {}", err);
                return;
            }
        };
        if let Err(err) = link.send_envelope(envelope).await {
            warn!(
                "failed to send result for command {}: {}",
                result.command_id, err
            );
        }
    });
}

fn replay_range(link: &Arc<AgentLink>, request: ReplayRequestPayload) {
    let (entries, oldest) = {
        let pending = link.pending.lock().unwrap_or_else(|e| e.into_inner());
        (
            pending.range(request.from_seq, request.to_seq_exclusive),
            pending.oldest_retained(),
        )
    };

    if oldest.is_none_or(|o| o > request.from_seq) {
        warn!(
            "replay range [{}, {}) partially irrecoverable; oldest retained seq is {:?}",
            request.from_seq, request.to_seq_exclusive, oldest
        );
    }

    let link = Arc::clone(link);
    tokio::spawn(async move {
        debug!(
            "replaying {} events for range [{}, {})",
            entries.len(),
            request.from_seq,
            request.to_seq_exclusive
        );
        for envelope in entries {
            if let Err(err) = link.send_envelope(envelope).await {
                warn!("replay send failed: {}", err);
                break;
            }
        }
    });
}

/// Heartbeat ticker with a pause switch for tests. The interval cell is
/// shared so a `config_update` can retune it at runtime.
pub struct HeartbeatHandle {
    paused: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub fn spawn_heartbeat(
    link: Arc<AgentLink>,
    interval_sec: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> HeartbeatHandle {
    let paused = Arc::new(AtomicBool::new(false));
    let paused_flag = Arc::clone(&paused);

    let handle = tokio::spawn(async move {
        loop {
            let interval = Duration::from_secs(interval_sec.load(Ordering::SeqCst).max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if paused_flag.load(Ordering::SeqCst) {
                continue;
            }

            let payload = HeartbeatPayload {
                status: "ok".to_string(),
            };
            match Envelope::new(kind::HEARTBEAT, &payload) {
                Ok(envelope) => {
                    if let Err(err) = link.send_envelope(envelope).await {
                        debug!("heartbeat skipped: {}", err);
                    }
                }
                Err(err) => warn!("failed to build heartbeat: {}", err),
            }
        }
    });

    HeartbeatHandle { paused, handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_buffer_cumulative_ack() {
        let mut buffer = PendingBuffer::default();
        for seq in 1..=5u64 {
            let envelope =
                Envelope::new(kind::EVENT, &serde_json::json!({"seq": seq})).unwrap();
            buffer.push(seq, envelope);
        }

        buffer.ack(3);
        assert_eq!(buffer.last_acked, 3);
        assert_eq!(buffer.entries.len(), 2);
        assert_eq!(buffer.oldest_retained(), Some(4));

        // Acks never move backwards.
        buffer.ack(2);
        assert_eq!(buffer.last_acked, 3);
        assert_eq!(buffer.entries.len(), 2);

        buffer.ack(5);
        assert!(buffer.entries.is_empty());
    }

    #[test]
    fn test_pending_buffer_range() {
        let mut buffer = PendingBuffer::default();
        for seq in 1..=10u64 {
            let envelope =
                Envelope::new(kind::EVENT, &serde_json::json!({"seq": seq})).unwrap();
            buffer.push(seq, envelope);
        }
        buffer.ack(4);

        let replay = buffer.range(5, 8);
        assert_eq!(replay.len(), 3);
        let replay = buffer.range(1, 5);
        assert!(replay.is_empty(), "acked entries are gone");
    }

    #[test]
    fn test_dial_request_carries_identity() {
        let link = AgentLink::new(
            LinkConfig::new("ws://127.0.0.1:9190/ws/agent", "secret", "agent-1")
                .with_projects(vec!["proj-a".to_string(), "proj-b".to_string()]),
        );

        let request = link.dial_request().unwrap();
        assert_eq!(
            request.uri().query(),
            Some("projects=proj-a,proj-b")
        );
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer secret"
        );
        assert_eq!(request.headers().get("X-Node-ID").unwrap(), "agent-1");
    }

    #[tokio::test]
    async fn test_send_event_buffers_before_io() {
        // Disconnected link: the send fails but the event must still be
        // queued with a monotone seq for the next reconnect.
        let link = AgentLink::new(LinkConfig::new("ws://127.0.0.1:1/ws/agent", "t", "n1"));

        let seq1 = link
            .send_event(None, "session.updated", serde_json::json!({}))
            .await
            .unwrap();
        let seq2 = link
            .send_event(None, "session.updated", serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
        assert_eq!(link.pending_len(), 2);

        link.acknowledge_seq(1);
        assert_eq!(link.pending_len(), 1);
        assert_eq!(link.last_acked_seq(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let link = AgentLink::new(LinkConfig::new("ws://127.0.0.1:1/ws/agent", "t", "n1"));
        link.connect();
        link.close().await;
        link.close().await;
        assert!(!link.is_connected());
        assert!(link.send_envelope(
            Envelope::new(kind::HEARTBEAT, &serde_json::json!({"status":"ok"})).unwrap()
        )
        .await
        .is_err());
    }
}
