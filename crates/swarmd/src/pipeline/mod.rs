//! Event pipeline: sequenced ingest with dedup, gap recovery, ordered
//! persistence, and non-blocking fan-out.
//!
//! Per node the acceptance gate is `seq`: exactly `expected_seq` is
//! persisted immediately, anything newer waits in a holding area while the
//! missing range is requested for replay, anything older is a resend
//! duplicate. The pipeline itself performs no socket I/O; it returns
//! [`Signal`]s the hub turns into `ack` and `replay_request` frames.

mod repository;

pub use repository::{EventRepository, StoredEvent};

use anyhow::Result;
use log::{debug, info, warn};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use swarm_protocol::EventPayload;

/// Node id under which the supervisor records its own events (policy
/// actions, detected losses); keeps the `(node_id, seq)` uniqueness
/// invariant intact for locally produced rows.
pub const SUPERVISOR_NODE_ID: &str = "supervisor";

/// Recently seen event ids per node. Sized above any plausible agent
/// pending buffer so a full reconnect resend never slips past dedup.
const DEDUP_CACHE_CAP: usize = 16_384;

/// Upper bound on buffered out-of-order events per node.
const HOLDING_CAP: usize = 16_384;

/// A gap with no progress for this long is recorded as a loss and skipped.
const REPLAY_DEADLINE: Duration = Duration::from_secs(10);

const FANOUT_BUFFER_SIZE: usize = 256;

/// Outbound reaction to an ingest, delivered by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Cumulative acknowledgement up to and including `seq`.
    Ack { seq: u64 },
    /// Ask the node to resend `[from_seq, to_seq_exclusive)`.
    Replay { from_seq: u64, to_seq_exclusive: u64 },
}

/// Insertion-ordered bounded set of event ids.
#[derive(Debug, Default)]
struct BoundedIdSet {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl BoundedIdSet {
    fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: &str) {
        if self.set.insert(id.to_string()) {
            self.order.push_back(id.to_string());
            while self.order.len() > DEDUP_CACHE_CAP {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
        }
    }
}

#[derive(Debug)]
struct NodeStream {
    expected_seq: u64,
    seen: BoundedIdSet,
    holding: BTreeMap<u64, EventPayload>,
    gap_since: Option<Instant>,
    replay_requested_to: u64,
}

impl NodeStream {
    fn new(expected_seq: u64) -> Self {
        Self {
            expected_seq,
            seen: BoundedIdSet::default(),
            holding: BTreeMap::new(),
            gap_since: None,
            replay_requested_to: 0,
        }
    }
}

pub struct EventPipeline {
    repo: EventRepository,
    streams: tokio::sync::Mutex<HashMap<String, NodeStream>>,
    fanout: broadcast::Sender<StoredEvent>,
    local: Arc<SupervisorEventWriter>,
}

impl EventPipeline {
    pub fn new(pool: SqlitePool, local: Arc<SupervisorEventWriter>) -> Self {
        let (fanout, _) = broadcast::channel(FANOUT_BUFFER_SIZE);
        Self {
            repo: EventRepository::new(pool),
            streams: tokio::sync::Mutex::new(HashMap::new()),
            fanout,
            local,
        }
    }

    /// Seed per-node cursors so a restart resumes at `max(seq) + 1`.
    pub async fn load_from_db(&self) -> Result<()> {
        let seqs = self.repo.max_seqs().await?;
        let mut streams = self.streams.lock().await;
        for (node_id, max_seq) in seqs {
            streams.insert(node_id, NodeStream::new(max_seq.max(0) as u64 + 1));
        }
        Ok(())
    }

    /// Subscribers get every persisted event, best-effort: a lagging
    /// receiver drops messages, never the pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<StoredEvent> {
        self.fanout.subscribe()
    }

    pub fn repository(&self) -> &EventRepository {
        &self.repo
    }

    /// Align a node's cursor with the `last_seq` it reported at register.
    /// A node reporting less than we expect restarted its counter; accept
    /// the new numbering and rely on id dedup for the overlap.
    pub async fn sync_node(&self, node_id: &str, last_seq: u64) -> Result<()> {
        let mut streams = self.streams.lock().await;
        self.ensure_stream(&mut streams, node_id).await?;
        let Some(stream) = streams.get_mut(node_id) else {
            return Ok(());
        };

        if last_seq + 1 < stream.expected_seq {
            warn!(
                "node {} restarted its sequence (reported {}, expected {}); resyncing",
                node_id, last_seq, stream.expected_seq
            );
            stream.expected_seq = last_seq + 1;
            stream.holding.clear();
            stream.gap_since = None;
            stream.replay_requested_to = 0;
        }
        Ok(())
    }

    /// Ingest one event from a node. Returns the signals the hub should
    /// send back on that node's connection.
    pub async fn ingest(&self, node_id: &str, event: EventPayload) -> Result<Vec<Signal>> {
        let mut streams = self.streams.lock().await;
        self.ensure_stream(&mut streams, node_id).await?;
        let Some(stream) = streams.get_mut(node_id) else {
            return Ok(Vec::new());
        };

        if stream.seen.contains(&event.id) {
            debug!("duplicate event id {} dropped", event.id);
            return Ok(Vec::new());
        }

        if event.seq < stream.expected_seq {
            debug!(
                "stale event seq {} from {} (expected {}) dropped",
                event.seq, node_id, stream.expected_seq
            );
            return Ok(Vec::new());
        }

        if event.seq > stream.expected_seq {
            if stream.holding.len() >= HOLDING_CAP {
                warn!(
                    "holding area for {} full; dropping event seq {}",
                    node_id, event.seq
                );
                return Ok(Vec::new());
            }

            let seq = event.seq;
            stream.holding.entry(seq).or_insert(event);
            if stream.gap_since.is_none() {
                stream.gap_since = Some(Instant::now());
            }

            // One replay request per detected range; extend only when a
            // later event widens the gap.
            if seq > stream.replay_requested_to {
                let from_seq = stream.expected_seq;
                stream.replay_requested_to = seq;
                debug!(
                    "gap detected for {}: requesting replay of [{}, {})",
                    node_id, from_seq, seq
                );
                return Ok(vec![Signal::Replay {
                    from_seq,
                    to_seq_exclusive: seq,
                }]);
            }
            return Ok(Vec::new());
        }

        // seq == expected: accept, then drain anything now contiguous.
        let mut accepted = vec![event];
        stream.expected_seq += 1;
        while let Some(next) = stream.holding.remove(&stream.expected_seq) {
            accepted.push(next);
            stream.expected_seq += 1;
        }

        if stream.holding.is_empty() {
            stream.gap_since = None;
            stream.replay_requested_to = 0;
        } else {
            // A later gap remains; restart its clock.
            stream.gap_since = Some(Instant::now());
        }

        for event in &accepted {
            stream.seen.insert(&event.id);
        }
        let acked = stream.expected_seq - 1;

        // Persist in seq order before acking anything.
        for event in accepted {
            self.persist(node_id, event).await?;
        }

        Ok(vec![Signal::Ack { seq: acked }])
    }

    /// Abandon gaps that replay could not fill within the deadline: record
    /// the loss, jump to the lowest held seq, and drain. Driven from the
    /// hub's monitor tick.
    pub async fn flush_stale_gaps(&self) -> Result<Vec<(String, Vec<Signal>)>> {
        let mut out = Vec::new();
        let mut streams = self.streams.lock().await;

        for (node_id, stream) in streams.iter_mut() {
            let stale = stream
                .gap_since
                .is_some_and(|since| since.elapsed() >= REPLAY_DEADLINE);
            if !stale || stream.holding.is_empty() {
                continue;
            }

            let Some(lowest) = stream.holding.keys().next().copied() else {
                continue;
            };

            info!(
                "abandoning irrecoverable gap [{}, {}) for node {}",
                stream.expected_seq, lowest, node_id
            );
            self.local
                .record(
                    "sequence.loss",
                    None,
                    json!({
                        "node_id": node_id,
                        "from_seq": stream.expected_seq,
                        "to_seq_exclusive": lowest,
                    }),
                )
                .await?;

            stream.expected_seq = lowest;
            let mut accepted = Vec::new();
            while let Some(next) = stream.holding.remove(&stream.expected_seq) {
                accepted.push(next);
                stream.expected_seq += 1;
            }

            if stream.holding.is_empty() {
                stream.gap_since = None;
                stream.replay_requested_to = 0;
            } else {
                stream.gap_since = Some(Instant::now());
            }

            for event in &accepted {
                stream.seen.insert(&event.id);
            }
            let acked = stream.expected_seq - 1;
            for event in accepted {
                self.persist(node_id, event).await?;
            }

            out.push((node_id.clone(), vec![Signal::Ack { seq: acked }]));
        }

        Ok(out)
    }

    async fn ensure_stream(
        &self,
        streams: &mut HashMap<String, NodeStream>,
        node_id: &str,
    ) -> Result<()> {
        if !streams.contains_key(node_id) {
            let max_seq = self.repo.max_seq(node_id).await?;
            streams.insert(
                node_id.to_string(),
                NodeStream::new(max_seq.max(0) as u64 + 1),
            );
        }
        Ok(())
    }

    async fn persist(&self, node_id: &str, event: EventPayload) -> Result<()> {
        let stored = StoredEvent {
            id: event.id,
            node_id: node_id.to_string(),
            session_id: event.session_id,
            kind: event.kind,
            data: event.data.to_string(),
            timestamp: event.timestamp,
            seq: event.seq as i64,
        };
        if self.repo.insert(&stored).await? {
            // Fan-out is best effort; no receivers or lagging receivers
            // never back up persistence.
            let _ = self.fanout.send(stored);
        }
        Ok(())
    }
}

/// Writer for supervisor-origin events, with its own seq counter under
/// [`SUPERVISOR_NODE_ID`].
pub struct SupervisorEventWriter {
    repo: EventRepository,
    next_seq: AtomicU64,
}

impl SupervisorEventWriter {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let repo = EventRepository::new(pool);
        let max = repo.max_seq(SUPERVISOR_NODE_ID).await?;
        Ok(Self {
            repo,
            next_seq: AtomicU64::new(max.max(0) as u64),
        })
    }

    pub async fn record(
        &self,
        kind: &str,
        session_id: Option<String>,
        data: serde_json::Value,
    ) -> Result<StoredEvent> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = StoredEvent {
            id: EventPayload::event_id(SUPERVISOR_NODE_ID, seq),
            node_id: SUPERVISOR_NODE_ID.to_string(),
            session_id,
            kind: kind.to_string(),
            data: data.to_string(),
            timestamp: swarm_protocol::unix_now(),
            seq: seq as i64,
        };
        self.repo.insert(&event).await?;
        Ok(event)
    }
}
