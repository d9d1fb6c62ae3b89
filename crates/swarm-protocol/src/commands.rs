//! Command and command-result payloads.
//!
//! Commands travel supervisor → agent inside a `command` envelope whose
//! `request_id` mirrors `command_id`; the agent answers with exactly one
//! `command_result` carrying the same id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// The closed set of command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CreateSession,
    PromptSession,
    KillSession,
    RestartSession,
    SessionStatus,
    CredentialPush,
    OauthTrigger,
    ProvisionProject,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommandKind::CreateSession => "create_session",
            CommandKind::PromptSession => "prompt_session",
            CommandKind::KillSession => "kill_session",
            CommandKind::RestartSession => "restart_session",
            CommandKind::SessionStatus => "session_status",
            CommandKind::CredentialPush => "credential_push",
            CommandKind::OauthTrigger => "oauth_trigger",
            CommandKind::ProvisionProject => "provision_project",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for CommandKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_session" => Ok(CommandKind::CreateSession),
            "prompt_session" => Ok(CommandKind::PromptSession),
            "kill_session" => Ok(CommandKind::KillSession),
            "restart_session" => Ok(CommandKind::RestartSession),
            "session_status" => Ok(CommandKind::SessionStatus),
            "credential_push" => Ok(CommandKind::CredentialPush),
            "oauth_trigger" => Ok(CommandKind::OauthTrigger),
            "provision_project" => Ok(CommandKind::ProvisionProject),
            _ => Err(format!("unknown command type: {}", s)),
        }
    }
}

/// Node selector for a command. An explicit node id wins; otherwise the
/// dispatcher picks the online node owning the named project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

impl CommandTarget {
    pub fn node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            project: None,
        }
    }

    pub fn project(project: impl Into<String>) -> Self {
        Self {
            node_id: None,
            project: Some(project.into()),
        }
    }
}

/// A supervisor-to-agent operator request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command_id: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default)]
    pub target: CommandTarget,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl CommandPayload {
    pub fn new(command_id: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            command_id: command_id.into(),
            kind,
            target: CommandTarget::default(),
            args: Map::new(),
        }
    }

    pub fn with_target(mut self, target: CommandTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_string(), value);
        self
    }

    /// Fetch a string argument.
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Failure,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Success => write!(f, "success"),
            CommandStatus::Failure => write!(f, "failure"),
        }
    }
}

/// The agent's answer to a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultPayload {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
}

impl CommandResultPayload {
    pub fn success(command_id: impl Into<String>, output: Option<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: CommandStatus::Success,
            output,
            error: None,
            timestamp: crate::unix_now(),
        }
    }

    pub fn failure(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: CommandStatus::Failure,
            output: None,
            error: Some(error.into()),
            timestamp: crate::unix_now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// A credential bundle, carried in the args of a `credential_push` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPayload {
    #[serde(default)]
    pub target_node: String,
    pub env_vars: HashMap<String, String>,
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_kind_wire_names() {
        for kind in [
            CommandKind::CreateSession,
            CommandKind::PromptSession,
            CommandKind::KillSession,
            CommandKind::RestartSession,
            CommandKind::SessionStatus,
            CommandKind::CredentialPush,
            CommandKind::OauthTrigger,
            CommandKind::ProvisionProject,
        ] {
            let name = kind.to_string();
            assert_eq!(name.parse::<CommandKind>().unwrap(), kind);
            // serde uses the same snake_case name as Display
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", name));
        }
        assert!("self_destruct".parse::<CommandKind>().is_err());
    }

    #[test]
    fn test_command_payload_serialization() {
        let cmd = CommandPayload::new("cmd-1", CommandKind::PromptSession)
            .with_target(CommandTarget::node("agent-1"))
            .with_arg("session_id", json!("s-1"))
            .with_arg("message", json!("keep going"));

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""type":"prompt_session""#));

        let parsed: CommandPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, CommandKind::PromptSession);
        assert_eq!(parsed.target.node_id.as_deref(), Some("agent-1"));
        assert_eq!(parsed.arg_str("message"), Some("keep going"));
    }

    #[test]
    fn test_result_helpers() {
        let ok = CommandResultPayload::success("cmd-1", Some("s-1".to_string()));
        assert!(ok.is_success());
        assert_eq!(ok.output.as_deref(), Some("s-1"));

        let failed = CommandResultPayload::failure("cmd-2", "session not found");
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("session not found"));
    }

    #[test]
    fn test_credential_payload_decode() {
        let payload: CredentialPayload = serde_json::from_value(json!({
            "target_node": "agent-1",
            "env_vars": {"OPENAI_API_KEY": "key-v1"},
            "version": 1
        }))
        .unwrap();
        assert_eq!(payload.env_vars["OPENAI_API_KEY"], "key-v1");
        assert_eq!(payload.version, 1);
    }
}
