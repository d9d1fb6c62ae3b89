//! Agent-local session table.
//!
//! The authoritative record of the sessions this host owns. Command
//! handlers mutate it and the link reads it to build register snapshots on
//! every (re)connect.

use std::collections::HashMap;
use std::sync::Mutex;

use swarm_protocol::{RegisterPayload, SessionSnapshot};

/// One session owned by this agent.
#[derive(Debug, Clone)]
pub struct LocalSession {
    pub session_id: String,
    pub project: String,
    pub status: String,
    pub tokens: u64,
    pub cost: f64,
    pub started_at: i64,
}

impl LocalSession {
    pub fn new(session_id: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            project: project.into(),
            status: "running".to_string(),
            tokens: 0,
            cost: 0.0,
            started_at: swarm_protocol::unix_now(),
        }
    }
}

/// Shared agent state: hostname plus the live session table.
#[derive(Debug)]
pub struct AgentState {
    hostname: String,
    sessions: Mutex<HashMap<String, LocalSession>>,
}

impl AgentState {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn upsert(&self, session: LocalSession) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.session_id.clone(), session);
    }

    pub fn remove(&self, session_id: &str) -> Option<LocalSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<LocalSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    pub fn set_status(&self, session_id: &str, status: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.status = status.to_string();
                true
            }
            None => false,
        }
    }

    pub fn record_usage(&self, session_id: &str, tokens: u64, cost: f64) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.tokens = session.tokens.max(tokens);
                session.cost = session.cost.max(cost);
                true
            }
            None => false,
        }
    }

    /// Register snapshot body; the link fills in `last_seq`.
    pub fn snapshot(&self) -> RegisterPayload {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<SessionSnapshot> = sessions
            .values()
            .map(|s| SessionSnapshot {
                session_id: s.session_id.clone(),
                project: s.project.clone(),
                status: s.status.clone(),
                tokens: s.tokens,
                cost: s.cost,
                started_at: s.started_at,
            })
            .collect();
        entries.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        RegisterPayload {
            hostname: self.hostname.clone(),
            sessions: entries,
            last_seq: 0,
        }
    }
}

#[async_trait::async_trait]
impl crate::link::SnapshotProvider for AgentState {
    async fn snapshot_payload(&self) -> RegisterPayload {
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_sorted_and_complete() {
        let state = AgentState::new("host-a");
        state.upsert(LocalSession::new("s-b", "proj-1"));
        state.upsert(LocalSession::new("s-a", "proj-2"));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.hostname, "host-a");
        assert_eq!(snapshot.sessions.len(), 2);
        assert_eq!(snapshot.sessions[0].session_id, "s-a");
        assert_eq!(snapshot.sessions[1].session_id, "s-b");
    }

    #[test]
    fn test_status_and_usage_updates() {
        let state = AgentState::new("host-a");
        state.upsert(LocalSession::new("s-1", "proj"));

        assert!(state.set_status("s-1", "idle"));
        assert!(state.record_usage("s-1", 500, 0.25));
        assert!(!state.set_status("s-404", "idle"));

        let session = state.get("s-1").unwrap();
        assert_eq!(session.status, "idle");
        assert_eq!(session.tokens, 500);

        // Usage is monotone; a lower report never regresses it.
        state.record_usage("s-1", 100, 0.01);
        assert_eq!(state.get("s-1").unwrap().tokens, 500);
    }
}
