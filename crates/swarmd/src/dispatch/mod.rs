//! Command dispatcher: issue a command to one node, await the correlated
//! result, and keep the audit trail.
//!
//! Correlation is by `command_id` (a UUID unless the caller pre-assigned
//! one). Exactly one of four audit outcomes is recorded per unique id:
//! `success`, `failure`, `timed_out`, or it is still `pending`. Duplicate
//! ids are rejected before any side effect.

mod repository;

pub use repository::{AuditRow, CommandAuditRepository};

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use swarm_protocol::{CommandKind, CommandPayload, CommandResultPayload, CommandTarget};

use crate::registry::NodeRegistry;

/// Cap on how long a dispatch waits for its result.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("node_not_connected")]
    NodeNotConnected,
    #[error("send failed: {0}")]
    Send(String),
}

/// The slice of the hub the dispatcher needs.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send_command(
        &self,
        node_id: &str,
        command: &CommandPayload,
    ) -> Result<(), TransportError>;
}

/// The slice of the registry the dispatcher needs.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, target: &CommandTarget) -> Option<String>;
}

impl TargetResolver for NodeRegistry {
    fn resolve(&self, target: &CommandTarget) -> Option<String> {
        match &target.node_id {
            Some(node_id) => Some(node_id.clone()),
            None => self.pick_node(target.project.as_deref()),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("duplicate command id")]
    Duplicate,
    #[error("no online node matches the target")]
    NoTarget,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("timed out waiting for command result")]
    Timeout,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A command as callers describe it; the dispatcher fills in the id.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command_id: Option<String>,
    pub kind: CommandKind,
    pub target: CommandTarget,
    pub args: Map<String, Value>,
}

impl CommandSpec {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            command_id: None,
            kind,
            target: CommandTarget::default(),
            args: Map::new(),
        }
    }

    pub fn with_command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn with_target(mut self, target: CommandTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_arg(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_string(), value);
        self
    }
}

pub struct CommandDispatcher {
    transport: Arc<dyn CommandTransport>,
    resolver: Arc<dyn TargetResolver>,
    audit: CommandAuditRepository,
    pending: Mutex<HashMap<String, oneshot::Sender<CommandResultPayload>>>,
    default_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        pool: SqlitePool,
        transport: Arc<dyn CommandTransport>,
        resolver: Arc<dyn TargetResolver>,
    ) -> Self {
        Self {
            transport,
            resolver,
            audit: CommandAuditRepository::new(pool),
            pending: Mutex::new(HashMap::new()),
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn audit(&self) -> &CommandAuditRepository {
        &self.audit
    }

    /// Issue a command and wait for its correlated result. `deadline`
    /// lets callers shorten the wait; it never extends past the default
    /// cap.
    pub async fn dispatch(
        &self,
        spec: CommandSpec,
        deadline: Option<Duration>,
    ) -> Result<CommandResultPayload, DispatchError> {
        let command_id = spec
            .command_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let command = CommandPayload {
            command_id: command_id.clone(),
            kind: spec.kind,
            target: spec.target,
            args: spec.args,
        };

        if !self.audit.try_insert_pending(&command).await? {
            return Err(DispatchError::Duplicate);
        }

        let node_id = match self.resolver.resolve(&command.target) {
            Some(node_id) => node_id,
            None => {
                self.audit
                    .mark_finished(&command_id, "failed", Some("no online node matches target"))
                    .await?;
                return Err(DispatchError::NoTarget);
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(command_id.clone(), tx);

        if let Err(err) = self.transport.send_command(&node_id, &command).await {
            self.forget(&command_id);
            self.audit
                .mark_finished(&command_id, "failed", Some(&err.to_string()))
                .await?;
            return Err(DispatchError::SendFailed(err.to_string()));
        }

        let wait = deadline
            .unwrap_or(self.default_timeout)
            .min(self.default_timeout);

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => {
                self.audit
                    .mark_finished(
                        &command_id,
                        &result.status.to_string(),
                        result.error.as_deref(),
                    )
                    .await?;
                Ok(result)
            }
            Ok(Err(_closed)) => {
                self.forget(&command_id);
                self.audit
                    .mark_finished(&command_id, "failed", Some("result channel closed"))
                    .await?;
                Err(DispatchError::SendFailed("result channel closed".to_string()))
            }
            Err(_elapsed) => {
                self.forget(&command_id);
                self.audit
                    .mark_finished(&command_id, "timed_out", None)
                    .await?;
                Err(DispatchError::Timeout)
            }
        }
    }

    /// Demux one inbound `command_result`. Results with no waiter are
    /// audited and dropped.
    pub async fn handle_result(&self, result: CommandResultPayload) {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&result.command_id);

        match sender {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!("result waiter went away before delivery");
                }
            }
            None => {
                warn!("late result for command {}; audited and dropped", result.command_id);
                if let Err(err) = self.audit.record_late(&result).await {
                    warn!("failed to audit late result: {:#}", err);
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn forget(&self, command_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(command_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    /// Transport that answers every command successfully after a short
    /// delay, through the dispatcher's own demux.
    struct EchoTransport {
        dispatcher: Mutex<Option<Arc<CommandDispatcher>>>,
        fail_sends: bool,
        swallow: bool,
    }

    #[async_trait]
    impl CommandTransport for EchoTransport {
        async fn send_command(
            &self,
            _node_id: &str,
            command: &CommandPayload,
        ) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::NodeNotConnected);
            }
            if self.swallow {
                return Ok(());
            }
            let dispatcher = self
                .dispatcher
                .lock()
                .unwrap()
                .clone()
                .expect("dispatcher wired");
            let result = CommandResultPayload::success(&command.command_id, Some("ok".to_string()));
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                dispatcher.handle_result(result).await;
            });
            Ok(())
        }
    }

    struct FixedResolver(Option<String>);

    impl TargetResolver for FixedResolver {
        fn resolve(&self, target: &CommandTarget) -> Option<String> {
            target.node_id.clone().or_else(|| self.0.clone())
        }
    }

    async fn dispatcher_with(
        fail_sends: bool,
        swallow: bool,
    ) -> (Arc<CommandDispatcher>, Database) {
        let db = Database::in_memory().await.unwrap();
        let transport = Arc::new(EchoTransport {
            dispatcher: Mutex::new(None),
            fail_sends,
            swallow,
        });
        let dispatcher = Arc::new(CommandDispatcher::new(
            db.pool().clone(),
            transport.clone(),
            Arc::new(FixedResolver(Some("node-1".to_string()))),
        ));
        *transport.dispatcher.lock().unwrap() = Some(dispatcher.clone());
        (dispatcher, db)
    }

    #[tokio::test]
    async fn test_dispatch_correlates_result() {
        let (dispatcher, _db) = dispatcher_with(false, false).await;

        let result = dispatcher
            .dispatch(
                CommandSpec::new(CommandKind::SessionStatus)
                    .with_arg("session_id", json!("s-1")),
                None,
            )
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.output.as_deref(), Some("ok"));

        let row = dispatcher
            .audit()
            .get(&result.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "success");
        assert!(row.finished_at.is_some());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_command_id_rejected() {
        let (dispatcher, _db) = dispatcher_with(false, false).await;

        let spec = CommandSpec::new(CommandKind::SessionStatus).with_command_id("cmd-dup");
        dispatcher.dispatch(spec.clone(), None).await.unwrap();

        match dispatcher.dispatch(spec, None).await {
            Err(DispatchError::Duplicate) => {}
            other => panic!("expected duplicate rejection, got {:?}", other),
        }
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_is_immediate() {
        let (dispatcher, _db) = dispatcher_with(true, false).await;

        let err = dispatcher
            .dispatch(
                CommandSpec::new(CommandKind::KillSession).with_command_id("cmd-send-fail"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SendFailed(_)));

        let row = dispatcher.audit().get("cmd-send-fail").await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
    }

    #[tokio::test]
    async fn test_timeout_is_persisted() {
        let (dispatcher, _db) = dispatcher_with(false, true).await;

        let err = dispatcher
            .dispatch(
                CommandSpec::new(CommandKind::PromptSession).with_command_id("cmd-slow"),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout));

        let row = dispatcher.audit().get("cmd-slow").await.unwrap().unwrap();
        assert_eq!(row.status, "timed_out");
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_target_fails_fast() {
        let db = Database::in_memory().await.unwrap();
        let transport = Arc::new(EchoTransport {
            dispatcher: Mutex::new(None),
            fail_sends: false,
            swallow: false,
        });
        let dispatcher = CommandDispatcher::new(
            db.pool().clone(),
            transport,
            Arc::new(FixedResolver(None)),
        );

        let err = dispatcher
            .dispatch(CommandSpec::new(CommandKind::CreateSession), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoTarget));
    }

    #[tokio::test]
    async fn test_late_result_is_audited_and_dropped() {
        let (dispatcher, _db) = dispatcher_with(false, false).await;

        dispatcher
            .handle_result(CommandResultPayload::failure("cmd-late", "too slow"))
            .await;

        let row = dispatcher.audit().get("cmd-late").await.unwrap().unwrap();
        assert_eq!(row.status, "failure");
        assert_eq!(row.kind, "unknown");
    }
}
