//! Typed payload schemas for the non-command envelope kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One session in a register snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub project: String,
    pub status: String,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub started_at: i64,
}

/// Sent by the agent on every (re)connect: its current sessions plus the
/// highest event sequence it has assigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterPayload {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub sessions: Vec<SessionSnapshot>,
    #[serde(default)]
    pub last_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: String,
}

/// A sequenced event emitted by an agent. `seq` is the per-node acceptance
/// gate; `id` follows the `<node_id>-<zero-padded seq>` convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
    pub seq: u64,
}

impl EventPayload {
    /// Conventional event id for a node/seq pair.
    pub fn event_id(node_id: &str, seq: u64) -> String {
        format!("{}-{:06}", node_id, seq)
    }
}

/// Cumulative event acknowledgement, supervisor to agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AckPayload {
    pub seq: u64,
}

/// Request to resend a half-open sequence range after a detected gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRequestPayload {
    pub node_id: String,
    pub from_seq: u64,
    pub to_seq_exclusive: u64,
}

/// Agent's credential version report, sent on every (re)connect so the
/// supervisor can push updates if the agent is stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSyncPayload {
    pub node_id: String,
    pub credential_version: u64,
}

/// Authentication status of one external tool on the agent host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAuthStatus {
    pub tool: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub checked_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthStatePayload {
    #[serde(default)]
    pub statuses: Vec<ToolAuthStatus>,
}

/// Supervisor-pushed runtime configuration delta. Only the mutable subset
/// is modeled; unknown fields are ignored by serde.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_sec: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_convention() {
        assert_eq!(EventPayload::event_id("agent-order", 1), "agent-order-000001");
        assert_eq!(
            EventPayload::event_id("agent-order", 1000),
            "agent-order-001000"
        );
    }

    #[test]
    fn test_register_payload_defaults() {
        let payload: RegisterPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.sessions.is_empty());
        assert_eq!(payload.last_seq, 0);
    }

    #[test]
    fn test_event_payload_round_trip() {
        let event = EventPayload {
            id: EventPayload::event_id("n1", 3),
            session_id: Some("s-1".to_string()),
            kind: "session.updated".to_string(),
            data: serde_json::json!({"tokens": 1200}),
            timestamp: 1700000000,
            seq: 3,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"session.updated""#));

        let parsed: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "n1-000003");
        assert_eq!(parsed.seq, 3);
    }

    #[test]
    fn test_optional_session_id_omitted() {
        let event = EventPayload {
            id: "n1-000001".to_string(),
            session_id: None,
            kind: "node.note".to_string(),
            data: Value::Null,
            timestamp: 5,
            seq: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("session_id"));
    }
}
