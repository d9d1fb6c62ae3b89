//! Command handlers dispatched from the supervisor link.
//!
//! Each handler owns the full round trip for one command family: decode
//! the args, drive the session engine or credential store, update the
//! local session table, emit the matching event, and shape the outcome as
//! a `command_result` payload. Failures are always typed results, never
//! torn-down connections.

use async_trait::async_trait;
use log::{info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use swarm_protocol::{
    CommandKind, CommandPayload, CommandResultPayload, ConfigUpdatePayload, CredentialPayload,
    CredentialSyncPayload, Envelope, kind,
};

use crate::authwatch::AuthBroker;
use crate::config::ProjectConfig;
use crate::credentials::{ApplyOutcome, CredentialStore};
use crate::engine::SessionEngine;
use crate::link::{AgentLink, CommandHandler, ConnectHook, MessageHandler};
use crate::state::{AgentState, LocalSession};

/// Shared dependencies for every handler.
pub struct CommandContext {
    pub node_id: String,
    pub state: Arc<AgentState>,
    pub engine: Arc<dyn SessionEngine>,
    pub credentials: Arc<CredentialStore>,
    pub auth: Arc<dyn AuthBroker>,
    pub projects: Vec<ProjectConfig>,
    /// Weak so the link → handler → link loop does not pin the link alive.
    link: Weak<AgentLink>,
}

impl CommandContext {
    async fn emit(&self, session_id: Option<String>, event_kind: &str, data: Value) {
        if let Some(link) = self.link.upgrade() {
            if let Err(err) = link.send_event(session_id, event_kind, data).await {
                warn!("failed to emit {} event: {}", event_kind, err);
            }
        }
    }

    fn project_directory(&self, name: &str) -> Option<&str> {
        self.projects
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.directory.as_str())
    }

    fn default_project(&self) -> Option<&ProjectConfig> {
        self.projects.first()
    }
}

/// Wire every handler family into the link.
pub fn register_handlers(
    link: &Arc<AgentLink>,
    state: Arc<AgentState>,
    engine: Arc<dyn SessionEngine>,
    credentials: Arc<CredentialStore>,
    auth: Arc<dyn AuthBroker>,
    projects: Vec<ProjectConfig>,
) -> Arc<CommandContext> {
    let context = Arc::new(CommandContext {
        node_id: link.node_id().to_string(),
        state,
        engine,
        credentials,
        auth,
        projects,
        link: Arc::downgrade(link),
    });

    let sessions = Arc::new(SessionCommands {
        context: Arc::clone(&context),
    });
    for kind in [
        CommandKind::CreateSession,
        CommandKind::PromptSession,
        CommandKind::KillSession,
        CommandKind::RestartSession,
        CommandKind::SessionStatus,
    ] {
        link.register_command_handler(kind, sessions.clone());
    }

    link.register_command_handler(
        CommandKind::CredentialPush,
        Arc::new(CredentialCommands {
            context: Arc::clone(&context),
        }),
    );
    link.register_command_handler(
        CommandKind::OauthTrigger,
        Arc::new(OauthCommands {
            context: Arc::clone(&context),
        }),
    );

    context
}

// ============================================================================
// Session lifecycle commands
// ============================================================================

struct SessionCommands {
    context: Arc<CommandContext>,
}

#[async_trait]
impl CommandHandler for SessionCommands {
    async fn handle(&self, command: CommandPayload) -> CommandResultPayload {
        let command_id = command.command_id.clone();
        let outcome = match command.kind {
            CommandKind::CreateSession => self.create(&command).await,
            CommandKind::PromptSession => self.prompt(&command).await,
            CommandKind::KillSession => self.kill(&command).await,
            CommandKind::RestartSession => self.restart(&command).await,
            CommandKind::SessionStatus => self.status(&command).await,
            other => Err(format!("unexpected command type {} for session handler", other)),
        };

        match outcome {
            Ok(output) => CommandResultPayload::success(&command_id, output),
            Err(error) => CommandResultPayload::failure(&command_id, error),
        }
    }
}

impl SessionCommands {
    async fn create(&self, command: &CommandPayload) -> Result<Option<String>, String> {
        let context = &self.context;

        let project = match command
            .arg_str("project")
            .or(command.target.project.as_deref())
        {
            Some(name) => context
                .projects
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| format!("unknown project: {}", name))?,
            None => context
                .default_project()
                .ok_or_else(|| "no projects configured".to_string())?,
        };

        let prompt = command.arg_str("prompt");
        let session_id = context
            .engine
            .create_session(&project.directory, prompt)
            .await
            .map_err(|e| format!("create_session failed: {e:#}"))?;

        context.state.upsert(LocalSession::new(&session_id, &project.name));
        info!("created session {} in {}", session_id, project.name);
        context
            .emit(
                Some(session_id.clone()),
                "session.created",
                json!({"project": project.name, "status": "running"}),
            )
            .await;

        Ok(Some(session_id))
    }

    async fn prompt(&self, command: &CommandPayload) -> Result<Option<String>, String> {
        let context = &self.context;
        let session_id = required_arg(command, "session_id")?;
        let message = command
            .arg_str("message")
            .or(command.arg_str("prompt"))
            .ok_or_else(|| "missing message".to_string())?;

        context
            .engine
            .prompt_session(session_id, message)
            .await
            .map_err(|e| format!("prompt_session failed: {e:#}"))?;

        context.state.set_status(session_id, "running");
        context
            .emit(
                Some(session_id.to_string()),
                "session.updated",
                json!({"status": "running"}),
            )
            .await;
        Ok(None)
    }

    async fn kill(&self, command: &CommandPayload) -> Result<Option<String>, String> {
        let context = &self.context;
        let session_id = required_arg(command, "session_id")?;

        context
            .engine
            .kill_session(session_id)
            .await
            .map_err(|e| format!("kill_session failed: {e:#}"))?;

        context.state.set_status(session_id, "completed");
        context
            .emit(
                Some(session_id.to_string()),
                "session.updated",
                json!({"status": "completed"}),
            )
            .await;
        Ok(None)
    }

    async fn restart(&self, command: &CommandPayload) -> Result<Option<String>, String> {
        let context = &self.context;
        let session_id = required_arg(command, "session_id")?;

        let project_name = context
            .state
            .get(session_id)
            .map(|s| s.project)
            .or_else(|| context.default_project().map(|p| p.name.clone()))
            .ok_or_else(|| "no projects configured".to_string())?;
        let directory = context
            .project_directory(&project_name)
            .ok_or_else(|| format!("unknown project: {}", project_name))?
            .to_string();

        // Kill-then-create; a session the engine already lost is fine.
        if let Err(err) = context.engine.kill_session(session_id).await {
            warn!("restart: kill of {} failed: {:#}", session_id, err);
        }
        context.state.remove(session_id);
        context
            .emit(
                Some(session_id.to_string()),
                "session.updated",
                json!({"status": "deleted"}),
            )
            .await;

        let new_id = context
            .engine
            .create_session(&directory, None)
            .await
            .map_err(|e| format!("restart create failed: {e:#}"))?;

        context
            .state
            .upsert(LocalSession::new(&new_id, &project_name));
        info!("restarted session {} as {}", session_id, new_id);
        context
            .emit(
                Some(new_id.clone()),
                "session.created",
                json!({"project": project_name, "status": "running", "restarted_from": session_id}),
            )
            .await;

        Ok(Some(new_id))
    }

    async fn status(&self, command: &CommandPayload) -> Result<Option<String>, String> {
        let context = &self.context;
        let session_id = required_arg(command, "session_id")?;

        match context.engine.session_status(session_id).await {
            Ok(status) => Ok(Some(status)),
            Err(engine_err) => match context.state.get(session_id) {
                Some(session) => Ok(Some(session.status)),
                None => Err(format!("session not found: {} ({engine_err:#})", session_id)),
            },
        }
    }
}

fn required_arg<'a>(command: &'a CommandPayload, name: &str) -> Result<&'a str, String> {
    command
        .arg_str(name)
        .ok_or_else(|| format!("missing {}", name))
}

// ============================================================================
// Credential push
// ============================================================================

struct CredentialCommands {
    context: Arc<CommandContext>,
}

#[async_trait]
impl CommandHandler for CredentialCommands {
    async fn handle(&self, command: CommandPayload) -> CommandResultPayload {
        let context = &self.context;
        let command_id = command.command_id.clone();

        let mut payload: CredentialPayload =
            match serde_json::from_value(Value::Object(command.args.clone())) {
                Ok(payload) => payload,
                Err(err) => {
                    return CommandResultPayload::failure(
                        &command_id,
                        format!("invalid credential payload: {}", err),
                    );
                }
            };
        if payload.target_node.is_empty() {
            payload.target_node = context.node_id.clone();
        }

        match context.credentials.apply_if_new(&command_id, &payload) {
            Ok(ApplyOutcome::Applied) => {
                info!(
                    "applied credential bundle version {} ({} vars)",
                    payload.version,
                    payload.env_vars.len()
                );
                CommandResultPayload::success(
                    &command_id,
                    Some(format!("applied version {}", payload.version)),
                )
            }
            Ok(ApplyOutcome::AlreadyApplied) => {
                info!("credential command {} already applied", command_id);
                CommandResultPayload::success(&command_id, Some("already applied".to_string()))
            }
            Ok(ApplyOutcome::Stale) => {
                info!(
                    "ignored stale credential bundle version {} (current {})",
                    payload.version,
                    context.credentials.get_version()
                );
                CommandResultPayload::success(
                    &command_id,
                    Some(format!(
                        "stale version {}, keeping {}",
                        payload.version,
                        context.credentials.get_version()
                    )),
                )
            }
            Err(err) => {
                // Secrets must never reach the log; redact before emitting.
                let masked = context.credentials.mask_value(&format!("{err:#}"));
                warn!("credential apply failed: {}", masked);
                CommandResultPayload::failure(&command_id, masked)
            }
        }
    }
}

// ============================================================================
// OAuth trigger
// ============================================================================

struct OauthCommands {
    context: Arc<CommandContext>,
}

#[async_trait]
impl CommandHandler for OauthCommands {
    async fn handle(&self, command: CommandPayload) -> CommandResultPayload {
        let command_id = command.command_id.clone();
        let tool = match command.arg_str("tool") {
            Some(tool) => tool,
            None => return CommandResultPayload::failure(&command_id, "missing tool"),
        };

        let outcome = self.context.auth.trigger(tool).await;
        match serde_json::to_string(&outcome) {
            Ok(output) => CommandResultPayload::success(&command_id, Some(output)),
            Err(err) => CommandResultPayload::failure(
                &command_id,
                format!("failed to encode oauth outcome: {}", err),
            ),
        }
    }
}

// ============================================================================
// Connection hooks and pushed config
// ============================================================================

/// On every (re)connect, report the credential version so the supervisor
/// can push a fresher bundle.
pub struct CredentialSyncHook {
    pub node_id: String,
    pub credentials: Arc<CredentialStore>,
}

#[async_trait]
impl ConnectHook for CredentialSyncHook {
    async fn on_connect(&self, link: &AgentLink) -> anyhow::Result<()> {
        let payload = CredentialSyncPayload {
            node_id: self.node_id.clone(),
            credential_version: self.credentials.get_version(),
        };
        let envelope = Envelope::new(kind::CREDENTIAL_SYNC, &payload)?;
        link.send_envelope(envelope).await
    }
}

/// Applies supervisor-pushed `config_update` messages to the mutable
/// runtime knobs.
pub struct ConfigUpdateHandler {
    pub heartbeat_interval_sec: Arc<AtomicU64>,
}

#[async_trait]
impl MessageHandler for ConfigUpdateHandler {
    async fn handle(&self, envelope: Envelope) {
        if envelope.kind != kind::CONFIG_UPDATE {
            log::debug!("ignoring message kind {}", envelope.kind);
            return;
        }
        match envelope.payload_as::<ConfigUpdatePayload>() {
            Ok(update) => {
                if let Some(interval) = update.heartbeat_interval_sec {
                    if interval > 0 {
                        info!("heartbeat interval updated to {}s", interval);
                        self.heartbeat_interval_sec.store(interval, Ordering::SeqCst);
                    }
                }
            }
            Err(err) => warn!("bad config_update payload: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authwatch::ToolPathBroker;
    use crate::config::ToolPaths;
    use crate::engine::fake::FakeEngine;
    use crate::link::LinkConfig;

    fn test_context() -> (Arc<AgentLink>, Arc<CommandContext>, Arc<FakeEngine>) {
        let link = AgentLink::new(LinkConfig::new("ws://127.0.0.1:1/ws/agent", "t", "agent-1"));
        let engine = Arc::new(FakeEngine::new());
        let context = register_handlers(
            &link,
            Arc::new(AgentState::new("host-1")),
            engine.clone(),
            Arc::new(CredentialStore::new()),
            Arc::new(ToolPathBroker::new(&ToolPaths::default())),
            vec![ProjectConfig {
                name: "proj-a".to_string(),
                directory: "/srv/proj-a".to_string(),
            }],
        );
        (link, context, engine)
    }

    fn command(kind: CommandKind) -> CommandPayload {
        CommandPayload::new("cmd-1", kind)
    }

    #[tokio::test]
    async fn test_create_and_status() {
        let (_link, context, _engine) = test_context();
        let handler = SessionCommands {
            context: Arc::clone(&context),
        };

        let result = handler
            .handle(command(CommandKind::CreateSession).with_arg("prompt", json!("hello")))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        let session_id = result.output.unwrap();

        let result = handler
            .handle(command(CommandKind::SessionStatus).with_arg("session_id", json!(session_id)))
            .await;
        assert!(result.is_success());
        assert_eq!(result.output.as_deref(), Some("running"));
    }

    #[tokio::test]
    async fn test_unknown_project_is_typed_failure() {
        let (_link, context, _engine) = test_context();
        let handler = SessionCommands { context };

        let result = handler
            .handle(command(CommandKind::CreateSession).with_arg("project", json!("nope")))
            .await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("unknown project"));
    }

    #[tokio::test]
    async fn test_restart_returns_new_id() {
        let (_link, context, _engine) = test_context();
        let handler = SessionCommands {
            context: Arc::clone(&context),
        };

        let created = handler.handle(command(CommandKind::CreateSession)).await;
        let old_id = created.output.unwrap();

        let result = handler
            .handle(command(CommandKind::RestartSession).with_arg("session_id", json!(old_id)))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        let new_id = result.output.unwrap();
        assert_ne!(new_id, old_id);
        assert!(context.state.get(&old_id).is_none());
        assert_eq!(context.state.get(&new_id).unwrap().status, "running");
    }

    #[tokio::test]
    async fn test_kill_marks_completed() {
        let (_link, context, _engine) = test_context();
        let handler = SessionCommands {
            context: Arc::clone(&context),
        };

        let created = handler.handle(command(CommandKind::CreateSession)).await;
        let session_id = created.output.unwrap();

        let result = handler
            .handle(command(CommandKind::KillSession).with_arg("session_id", json!(session_id)))
            .await;
        assert!(result.is_success());
        assert_eq!(context.state.get(&session_id).unwrap().status, "completed");
    }

    #[tokio::test]
    async fn test_credential_push_duplicate_command_id() {
        let (_link, context, _engine) = test_context();
        let handler = CredentialCommands {
            context: Arc::clone(&context),
        };

        let push = |version: u64, value: &str| {
            command(CommandKind::CredentialPush)
                .with_arg("env_vars", json!({"OPENAI_API_KEY": value}))
                .with_arg("version", json!(version))
        };

        let result = handler.handle(push(1, "key-v1")).await;
        assert!(result.is_success(), "{:?}", result.error);

        // Same command_id, different payload: must not re-apply.
        let result = handler.handle(push(2, "key-v2")).await;
        assert!(result.is_success());
        assert_eq!(result.output.as_deref(), Some("already applied"));

        assert_eq!(context.credentials.get_env()["OPENAI_API_KEY"], "key-v1");
        assert_eq!(context.credentials.get_version(), 1);
    }

    #[tokio::test]
    async fn test_oauth_trigger_unknown_tool() {
        let (_link, context, _engine) = test_context();
        let handler = OauthCommands { context };

        let result = handler
            .handle(command(CommandKind::OauthTrigger).with_arg("tool", json!("mystery")))
            .await;
        assert!(result.is_success());
        let outcome: crate::authwatch::OauthOutcome =
            serde_json::from_str(result.output.as_deref().unwrap()).unwrap();
        assert_eq!(outcome.status, crate::authwatch::OauthStatus::Failure);
    }
}
