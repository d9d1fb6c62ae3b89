//! One accepted agent connection.

use axum::extract::ws::{Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use swarm_protocol::Envelope;

use crate::dispatch::TransportError;

/// A live socket bound to one node id. The write half sits behind a
/// mutex: a WebSocket allows only one writer at a time.
pub struct AgentConn {
    node_id: String,
    /// Distinguishes this connection from one that displaced it.
    epoch: u64,
    sender: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    last_heartbeat: Mutex<Instant>,
    heartbeat_paused: AtomicBool,
    closed: CancellationToken,
    write_timeout: Duration,
}

impl AgentConn {
    pub fn new(
        node_id: String,
        epoch: u64,
        sender: SplitSink<WebSocket, Message>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            epoch,
            sender: tokio::sync::Mutex::new(sender),
            last_heartbeat: Mutex::new(Instant::now()),
            heartbeat_paused: AtomicBool::new(false),
            closed: CancellationToken::new(),
            write_timeout,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn touch(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Test instrumentation: a paused connection skips the staleness
    /// check in the heartbeat monitor.
    pub fn pause_heartbeat(&self, paused: bool) {
        self.heartbeat_paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_heartbeat_paused(&self) -> bool {
        self.heartbeat_paused.load(Ordering::SeqCst)
    }

    /// Signal the read loop to stop; teardown happens there.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = envelope
            .encode()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        self.send_text(text).await
    }

    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let mut sender = self.sender.lock().await;
        match tokio::time::timeout(self.write_timeout, sender.send(Message::Text(text.into())))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TransportError::Send(err.to_string())),
            Err(_) => Err(TransportError::Send("write deadline exceeded".to_string())),
        }
    }
}
