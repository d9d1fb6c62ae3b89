//! Session tracker: the supervisor's authoritative view of every session
//! in the fleet, reconciled against agent snapshots and the event stream.

mod models;
mod repository;

pub use models::{SessionStatus, TrackedSession};
pub use repository::{SessionRepository, SessionRow};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use swarm_protocol::SessionSnapshot;

use crate::pipeline::StoredEvent;

pub struct SessionTracker {
    repo: SessionRepository,
    sessions: RwLock<HashMap<String, TrackedSession>>,
    recovery_errors: AtomicU64,
}

impl SessionTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            repo: SessionRepository::new(pool),
            sessions: RwLock::new(HashMap::new()),
            recovery_errors: AtomicU64::new(0),
        }
    }

    /// Load persisted sessions, skipping and counting rows that fail to
    /// decode. Live statuses degrade to `unreachable` until the owning
    /// node reconnects and reports otherwise.
    pub async fn load_from_db(&self) -> Result<()> {
        let rows = self.repo.load_all().await?;
        let mut loaded = 0usize;
        let mut degraded = Vec::new();

        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            for row in rows {
                let mut session = match decode_row(&row) {
                    Ok(session) => session,
                    Err(err) => {
                        warn!("skipping corrupt session row {}: {}", row.id, err);
                        self.recovery_errors.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                };

                if matches!(
                    session.status,
                    SessionStatus::Running | SessionStatus::Idle | SessionStatus::Compacted
                ) {
                    session.status = SessionStatus::Unreachable;
                    degraded.push(session.session_id.clone());
                }
                sessions.insert(session.session_id.clone(), session);
                loaded += 1;
            }
        }

        for session_id in degraded {
            self.repo
                .update_status(&session_id, SessionStatus::Unreachable)
                .await?;
        }

        info!(
            "session tracker recovered {} sessions ({} corrupt rows skipped)",
            loaded,
            self.recovery_errors.load(Ordering::SeqCst)
        );
        Ok(())
    }

    pub fn recovery_error_count(&self) -> u64 {
        self.recovery_errors.load(Ordering::SeqCst)
    }

    pub async fn upsert(&self, session: TrackedSession) -> Result<()> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.session_id.clone(), session.clone());
        self.repo.upsert(&session).await
    }

    pub fn get(&self, session_id: &str) -> Option<TrackedSession> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<TrackedSession> {
        let mut sessions: Vec<TrackedSession> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn list_by_node(&self, node_id: &str) -> Vec<TrackedSession> {
        self.list()
            .into_iter()
            .filter(|s| s.node_id == node_id)
            .collect()
    }

    pub async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<bool> {
        let known = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            match sessions.get_mut(session_id) {
                Some(session) => {
                    session.status = status;
                    session.last_activity = Utc::now();
                    true
                }
                None => false,
            }
        };
        if known {
            self.repo.update_status(session_id, status).await?;
        }
        Ok(known)
    }

    /// Every live session of a node degrades to `unreachable` when the
    /// node drops; records are retained.
    pub async fn mark_unreachable(&self, node_id: &str) -> Result<()> {
        let changed: Vec<String> = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions
                .values_mut()
                .filter(|s| s.node_id == node_id && s.status != SessionStatus::Deleted)
                .map(|s| {
                    s.status = SessionStatus::Unreachable;
                    s.session_id.clone()
                })
                .collect()
        };

        for session_id in &changed {
            self.repo
                .update_status(session_id, SessionStatus::Unreachable)
                .await?;
        }
        if !changed.is_empty() {
            info!(
                "marked {} sessions unreachable for node {}",
                changed.len(),
                node_id
            );
        }
        Ok(())
    }

    /// Reconcile against a register snapshot: reported sessions are
    /// upserted with the snapshot's status; sessions the tracker holds for
    /// this node that the snapshot omits become `deleted`. A session
    /// reported by a second node displaces the first owner.
    pub async fn restore_from_snapshot(
        &self,
        node_id: &str,
        snapshot: &[SessionSnapshot],
    ) -> Result<()> {
        let now = Utc::now();
        let mut to_persist = Vec::new();

        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());

            for snap in snapshot {
                let status = snap
                    .status
                    .parse::<SessionStatus>()
                    .unwrap_or(SessionStatus::Running);

                let session = sessions
                    .entry(snap.session_id.clone())
                    .or_insert_with(|| TrackedSession::new(&snap.session_id, node_id, &snap.project));

                if session.node_id != node_id {
                    warn!(
                        "session {} moved from node {} to {}",
                        snap.session_id, session.node_id, node_id
                    );
                    session.node_id = node_id.to_string();
                }

                session.project = snap.project.clone();
                session.status = status;
                session.tokens = session.tokens.max(snap.tokens);
                session.cost = session.cost.max(snap.cost);
                if let Some(started) = DateTime::from_timestamp(snap.started_at, 0) {
                    if snap.started_at > 0 {
                        session.started_at = started;
                    }
                }
                session.last_activity = now;
                to_persist.push(session.clone());
            }

            for session in sessions.values_mut() {
                if session.node_id == node_id
                    && session.status != SessionStatus::Deleted
                    && !snapshot.iter().any(|s| s.session_id == session.session_id)
                {
                    session.status = SessionStatus::Deleted;
                    to_persist.push(session.clone());
                }
            }
        }

        for session in to_persist {
            self.repo.upsert(&session).await?;
        }
        Ok(())
    }

    /// Interpret one persisted event against the tracked state.
    pub async fn apply_event(&self, event: &StoredEvent) -> Result<()> {
        let Some(session_id) = &event.session_id else {
            return Ok(());
        };
        let data: serde_json::Value =
            serde_json::from_str(&event.data).unwrap_or(serde_json::Value::Null);

        match event.kind.as_str() {
            "session.created" => {
                let project = data["project"].as_str().unwrap_or_default().to_string();
                let mut session = TrackedSession::new(session_id, &event.node_id, project);
                if let Some(ts) = DateTime::from_timestamp(event.timestamp, 0) {
                    session.started_at = ts;
                    session.last_activity = ts;
                }
                self.upsert(session).await?;
            }
            "session.updated" => {
                let session = {
                    let mut sessions =
                        self.sessions.write().unwrap_or_else(|e| e.into_inner());
                    match sessions.get_mut(session_id) {
                        Some(session) => {
                            if let Some(status) = data["status"]
                                .as_str()
                                .and_then(|s| s.parse::<SessionStatus>().ok())
                            {
                                session.status = status;
                            }
                            if let Some(tokens) = data["tokens"].as_u64() {
                                session.tokens = session.tokens.max(tokens);
                            }
                            if let Some(cost) = data["cost"].as_f64() {
                                session.cost = session.cost.max(cost);
                            }
                            session.last_activity = DateTime::from_timestamp(event.timestamp, 0)
                                .unwrap_or_else(Utc::now);
                            Some(session.clone())
                        }
                        None => None,
                    }
                };
                match session {
                    Some(session) => self.repo.upsert(&session).await?,
                    None => debug!("session.updated for unknown session {}", session_id),
                }
            }
            _ => {
                // Any other session-scoped event still counts as activity.
                let session = {
                    let mut sessions =
                        self.sessions.write().unwrap_or_else(|e| e.into_inner());
                    sessions.get_mut(session_id).map(|session| {
                        session.last_activity = DateTime::from_timestamp(event.timestamp, 0)
                            .unwrap_or_else(Utc::now);
                        session.clone()
                    })
                };
                if let Some(session) = session {
                    self.repo.upsert(&session).await?;
                }
            }
        }
        Ok(())
    }
}

/// Drive tracker updates from the pipeline's fan-out channel.
pub fn spawn_tracker_updates(
    tracker: std::sync::Arc<SessionTracker>,
    mut events: tokio::sync::broadcast::Receiver<StoredEvent>,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    if let Err(err) = tracker.apply_event(&event).await {
                        warn!("failed to apply event {}: {:#}", event.id, err);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("tracker update stream lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn decode_row(row: &SessionRow) -> Result<TrackedSession, String> {
    let status: SessionStatus = row.status.parse()?;
    let started_at = parse_ts(&row.started_at)?;
    let last_activity = parse_ts(&row.last_activity)?;

    Ok(TrackedSession {
        session_id: row.id.clone(),
        node_id: row.node_id.clone(),
        project: row.project.clone(),
        status,
        tokens: row.tokens.max(0) as u64,
        cost: row.cost,
        started_at,
        last_activity,
    })
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {:?}: {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn tracker() -> SessionTracker {
        let db = Database::in_memory().await.unwrap();
        SessionTracker::new(db.pool().clone())
    }

    fn snap(session_id: &str, project: &str, status: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: session_id.to_string(),
            project: project.to_string(),
            status: status.to_string(),
            tokens: 0,
            cost: 0.0,
            started_at: 0,
        }
    }

    #[tokio::test]
    async fn test_snapshot_reconciliation() {
        let tracker = tracker().await;
        tracker
            .upsert(TrackedSession::new("s-old", "node-1", "proj"))
            .await
            .unwrap();

        tracker
            .restore_from_snapshot(
                "node-1",
                &[snap("s-new", "proj", "idle")],
            )
            .await
            .unwrap();

        assert_eq!(tracker.get("s-new").unwrap().status, SessionStatus::Idle);
        assert_eq!(
            tracker.get("s-old").unwrap().status,
            SessionStatus::Deleted,
            "sessions absent from the snapshot are deleted"
        );
    }

    #[tokio::test]
    async fn test_second_node_displaces_first() {
        let tracker = tracker().await;
        tracker
            .restore_from_snapshot("node-1", &[snap("s-1", "proj", "running")])
            .await
            .unwrap();
        tracker
            .restore_from_snapshot("node-2", &[snap("s-1", "proj", "running")])
            .await
            .unwrap();

        assert_eq!(tracker.get("s-1").unwrap().node_id, "node-2");
    }

    #[tokio::test]
    async fn test_mark_unreachable_retains_sessions() {
        let tracker = tracker().await;
        tracker
            .upsert(TrackedSession::new("s-1", "node-1", "proj"))
            .await
            .unwrap();
        tracker
            .upsert(TrackedSession::new("s-2", "node-2", "proj"))
            .await
            .unwrap();

        tracker.mark_unreachable("node-1").await.unwrap();

        assert_eq!(
            tracker.get("s-1").unwrap().status,
            SessionStatus::Unreachable
        );
        assert_eq!(tracker.get("s-2").unwrap().status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn test_corrupt_rows_are_counted() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO sessions (id, node_id, project, status, tokens, cost, started_at, last_activity) VALUES \
             ('ok', 'n1', 'p', 'running', 10, 0.5, '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00'), \
             ('bad', 'n1', 'p', 'running', 10, 0.5, 'not-a-timestamp', '2026-01-01T00:00:00+00:00')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let tracker = SessionTracker::new(db.pool().clone());
        tracker.load_from_db().await.unwrap();

        assert_eq!(tracker.recovery_error_count(), 1);
        assert_eq!(tracker.list().len(), 1);
        // Live sessions come back unreachable until the node reconnects.
        assert_eq!(
            tracker.get("ok").unwrap().status,
            SessionStatus::Unreachable
        );
    }

    #[tokio::test]
    async fn test_apply_event_updates_usage() {
        let tracker = tracker().await;
        tracker
            .upsert(TrackedSession::new("s-1", "node-1", "proj"))
            .await
            .unwrap();

        let event = StoredEvent {
            id: "node-1-000001".to_string(),
            node_id: "node-1".to_string(),
            session_id: Some("s-1".to_string()),
            kind: "session.updated".to_string(),
            data: r#"{"status":"idle","tokens":1200,"cost":0.75}"#.to_string(),
            timestamp: swarm_protocol::unix_now(),
            seq: 1,
        };
        tracker.apply_event(&event).await.unwrap();

        let session = tracker.get("s-1").unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.tokens, 1200);
        assert!((session.cost - 0.75).abs() < f64::EPSILON);
    }
}
