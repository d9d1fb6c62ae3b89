//! Wire protocol shared by the supervisor and agent daemons.
//!
//! Every message on the agent link is a UTF-8 JSON envelope carried as one
//! WebSocket text frame. The envelope header is versioned and validated on
//! both ends; payloads stay opaque until the receiving component decodes
//! them against the typed schemas in [`messages`] and [`commands`].

mod commands;
mod envelope;
mod messages;

pub use commands::{
    CommandKind, CommandPayload, CommandResultPayload, CommandStatus, CommandTarget,
    CredentialPayload,
};
pub use envelope::{Envelope, EnvelopeError, PROTOCOL_VERSION};
pub use messages::{
    AckPayload, AuthStatePayload, ConfigUpdatePayload, CredentialSyncPayload, EventPayload,
    HeartbeatPayload, RegisterPayload, ReplayRequestPayload, SessionSnapshot, ToolAuthStatus,
};

/// Message type discriminators carried in the envelope `type` field.
pub mod kind {
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const EVENT: &str = "event";
    pub const COMMAND: &str = "command";
    pub const COMMAND_RESULT: &str = "command_result";
    pub const CREDENTIAL_SYNC: &str = "credential_sync";
    pub const AUTH_STATE: &str = "auth_state";
    pub const CONFIG_UPDATE: &str = "config_update";
    pub const ACK: &str = "ack";
    pub const REPLAY_REQUEST: &str = "replay_request";
}

/// Current time as unix seconds, the envelope timestamp unit.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
