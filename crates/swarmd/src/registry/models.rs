//! Node registry data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node liveness as tracked by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            _ => Err(format!("unknown node status: {}", s)),
        }
    }
}

/// A registered agent instance.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub node_id: String,
    pub hostname: String,
    /// Projects the node declared at connect time. Not persisted; refreshed
    /// on every register.
    pub projects: Vec<String>,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

impl Node {
    pub fn owns_project(&self, project: &str) -> bool {
        self.projects.iter().any(|p| p == project)
    }
}
