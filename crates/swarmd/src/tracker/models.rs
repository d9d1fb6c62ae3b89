//! Tracked session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session status as tracked by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Idle,
    Compacted,
    Error,
    Completed,
    /// The owning node went offline; the session is retained.
    Unreachable,
    /// Absent from the owning node's last snapshot.
    Deleted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Compacted => "compacted",
            SessionStatus::Error => "error",
            SessionStatus::Completed => "completed",
            SessionStatus::Unreachable => "unreachable",
            SessionStatus::Deleted => "deleted",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(SessionStatus::Running),
            "idle" => Ok(SessionStatus::Idle),
            "compacted" => Ok(SessionStatus::Compacted),
            "error" => Ok(SessionStatus::Error),
            "completed" => Ok(SessionStatus::Completed),
            "unreachable" => Ok(SessionStatus::Unreachable),
            "deleted" => Ok(SessionStatus::Deleted),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A session owned by some node, as the supervisor sees it.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedSession {
    pub session_id: String,
    pub node_id: String,
    pub project: String,
    pub status: SessionStatus,
    /// Monotone token usage.
    pub tokens: u64,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl TrackedSession {
    pub fn new(
        session_id: impl Into<String>,
        node_id: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            node_id: node_id.into(),
            project: project.into(),
            status: SessionStatus::Running,
            tokens: 0,
            cost: 0.0,
            started_at: now,
            last_activity: now,
        }
    }
}
