//! Automatic intervention policies over tracked sessions.
//!
//! A periodic scan applies the rules in fixed order; each firing goes
//! through the command dispatcher and leaves a `policy.action` event so
//! interventions are auditable and replayable. Retry counters keyed by
//! `(session, rule)` cap how often a rule may fire before its reset
//! window passes.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use swarm_protocol::{CommandKind, CommandResultPayload, CommandTarget};

use crate::dispatch::{CommandDispatcher, CommandSpec, DispatchError};
use crate::pipeline::SupervisorEventWriter;
use crate::tracker::{SessionStatus, SessionTracker, TrackedSession};

const RULE_RESUME_ON_IDLE: &str = "resume_on_idle";
const RULE_RESTART_ON_COMPACTION: &str = "restart_on_compaction";
const RULE_KILL_ON_COST: &str = "kill_on_cost";

fn default_true() -> bool {
    true
}

fn default_idle_threshold() -> u64 {
    900
}

fn default_token_threshold() -> u64 {
    150_000
}

fn default_cost_threshold() -> f64 {
    50.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_reset() -> u64 {
    1800
}

fn default_check_interval() -> u64 {
    60
}

fn default_nudge() -> String {
    "You have been idle for a while. Please continue with your current task.".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResumeOnIdleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_sec: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_reset")]
    pub retry_reset_seconds: u64,
    #[serde(default = "default_nudge")]
    pub nudge_message: String,
}

impl Default for ResumeOnIdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_threshold_sec: default_idle_threshold(),
            max_retries: default_max_retries(),
            retry_reset_seconds: default_retry_reset(),
            nudge_message: default_nudge(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestartOnCompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_reset")]
    pub retry_reset_seconds: u64,
}

impl Default for RestartOnCompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_threshold: default_token_threshold(),
            max_retries: default_max_retries(),
            retry_reset_seconds: default_retry_reset(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillOnCostConfig {
    /// Killing sessions is destructive; off unless an operator opts in.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cost_threshold")]
    pub cost_threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_reset")]
    pub retry_reset_seconds: u64,
}

impl Default for KillOnCostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cost_threshold: default_cost_threshold(),
            max_retries: default_max_retries(),
            retry_reset_seconds: default_retry_reset(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoliciesConfig {
    #[serde(default)]
    pub resume_on_idle: ResumeOnIdleConfig,
    #[serde(default)]
    pub restart_on_compaction: RestartOnCompactionConfig,
    #[serde(default)]
    pub kill_on_cost: KillOnCostConfig,
    #[serde(default = "default_check_interval")]
    pub check_interval_sec: u64,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            resume_on_idle: ResumeOnIdleConfig::default(),
            restart_on_compaction: RestartOnCompactionConfig::default(),
            kill_on_cost: KillOnCostConfig::default(),
            check_interval_sec: default_check_interval(),
        }
    }
}

/// The tracker slice the engine scans.
pub trait SessionView: Send + Sync {
    fn sessions(&self) -> Vec<TrackedSession>;
}

impl SessionView for SessionTracker {
    fn sessions(&self) -> Vec<TrackedSession> {
        self.list()
    }
}

/// The dispatcher slice the engine fires through.
#[async_trait]
pub trait CommandIssuer: Send + Sync {
    async fn issue(&self, spec: CommandSpec) -> Result<CommandResultPayload, DispatchError>;
}

#[async_trait]
impl CommandIssuer for CommandDispatcher {
    async fn issue(&self, spec: CommandSpec) -> Result<CommandResultPayload, DispatchError> {
        self.dispatch(spec, None).await
    }
}

struct RetryState {
    count: u32,
    last_fired: Instant,
}

pub struct PolicyEngine {
    config: PoliciesConfig,
    sessions: Arc<dyn SessionView>,
    issuer: Arc<dyn CommandIssuer>,
    events: Arc<SupervisorEventWriter>,
    retries: Mutex<HashMap<(String, &'static str), RetryState>>,
}

impl PolicyEngine {
    pub fn new(
        config: PoliciesConfig,
        sessions: Arc<dyn SessionView>,
        issuer: Arc<dyn CommandIssuer>,
        events: Arc<SupervisorEventWriter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions,
            issuer,
            events,
            retries: Mutex::new(HashMap::new()),
        })
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = self;
        tokio::spawn(async move {
            let interval = Duration::from_secs(engine.config.check_interval_sec.max(1));
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                engine.tick().await;
            }
        })
    }

    /// One scan over every tracked session, rules in fixed order. At most
    /// one rule fires per session per tick.
    pub async fn tick(&self) {
        for session in self.sessions.sessions() {
            if matches!(
                session.status,
                SessionStatus::Unreachable | SessionStatus::Deleted | SessionStatus::Completed
            ) {
                continue;
            }

            if self.check_resume_on_idle(&session).await
                || self.check_restart_on_compaction(&session).await
                || self.check_kill_on_cost(&session).await
            {
                continue;
            }
        }
    }

    async fn check_resume_on_idle(&self, session: &TrackedSession) -> bool {
        let rule = &self.config.resume_on_idle;
        if !rule.enabled || session.status != SessionStatus::Idle {
            return false;
        }

        let idle_secs = (Utc::now() - session.last_activity).num_seconds().max(0) as u64;
        if idle_secs < rule.idle_threshold_sec {
            return false;
        }
        if !self.retry_allows(
            &session.session_id,
            RULE_RESUME_ON_IDLE,
            rule.max_retries,
            rule.retry_reset_seconds,
        ) {
            return false;
        }

        let spec = CommandSpec::new(CommandKind::PromptSession)
            .with_target(CommandTarget::node(&session.node_id))
            .with_arg("session_id", json!(session.session_id))
            .with_arg("message", json!(rule.nudge_message));
        self.fire(
            RULE_RESUME_ON_IDLE,
            session,
            spec,
            json!({
                "idle_seconds": idle_secs,
                "idle_threshold_sec": rule.idle_threshold_sec,
            }),
        )
        .await;
        true
    }

    async fn check_restart_on_compaction(&self, session: &TrackedSession) -> bool {
        let rule = &self.config.restart_on_compaction;
        if !rule.enabled || session.tokens < rule.token_threshold {
            return false;
        }
        if !self.retry_allows(
            &session.session_id,
            RULE_RESTART_ON_COMPACTION,
            rule.max_retries,
            rule.retry_reset_seconds,
        ) {
            return false;
        }

        let spec = CommandSpec::new(CommandKind::RestartSession)
            .with_target(CommandTarget::node(&session.node_id))
            .with_arg("session_id", json!(session.session_id));
        self.fire(
            RULE_RESTART_ON_COMPACTION,
            session,
            spec,
            json!({
                "tokens": session.tokens,
                "token_threshold": rule.token_threshold,
            }),
        )
        .await;
        true
    }

    async fn check_kill_on_cost(&self, session: &TrackedSession) -> bool {
        let rule = &self.config.kill_on_cost;
        if !rule.enabled || session.cost < rule.cost_threshold {
            return false;
        }
        if !self.retry_allows(
            &session.session_id,
            RULE_KILL_ON_COST,
            rule.max_retries,
            rule.retry_reset_seconds,
        ) {
            return false;
        }

        let spec = CommandSpec::new(CommandKind::KillSession)
            .with_target(CommandTarget::node(&session.node_id))
            .with_arg("session_id", json!(session.session_id));
        self.fire(
            RULE_KILL_ON_COST,
            session,
            spec,
            json!({
                "cost": session.cost,
                "cost_threshold": rule.cost_threshold,
            }),
        )
        .await;
        true
    }

    /// Check and advance the retry counter for `(session, rule)`. The
    /// counter zeroes once `reset_seconds` pass without a firing; at
    /// `max_retries` the rule stays quiet for that session until reset.
    fn retry_allows(
        &self,
        session_id: &str,
        rule: &'static str,
        max_retries: u32,
        reset_seconds: u64,
    ) -> bool {
        let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
        let state = retries
            .entry((session_id.to_string(), rule))
            .or_insert(RetryState {
                count: 0,
                last_fired: Instant::now(),
            });

        if state.last_fired.elapsed() >= Duration::from_secs(reset_seconds) {
            state.count = 0;
        }
        if state.count >= max_retries {
            debug!(
                "rule {} for session {} at retry cap ({})",
                rule, session_id, max_retries
            );
            return false;
        }

        state.count += 1;
        state.last_fired = Instant::now();
        true
    }

    async fn fire(
        &self,
        rule: &'static str,
        session: &TrackedSession,
        spec: CommandSpec,
        inputs: serde_json::Value,
    ) {
        let command_id = Uuid::new_v4().to_string();
        info!(
            "policy {} firing for session {} (command {})",
            rule, session.session_id, command_id
        );

        let record = self
            .events
            .record(
                "policy.action",
                Some(session.session_id.clone()),
                json!({
                    "rule": rule,
                    "session_id": session.session_id,
                    "node_id": session.node_id,
                    "inputs": inputs,
                    "command_id": command_id,
                }),
            )
            .await;
        if let Err(err) = record {
            warn!("failed to persist policy.action: {:#}", err);
        }

        let issuer = Arc::clone(&self.issuer);
        let spec = spec.with_command_id(command_id.clone());
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            match issuer.issue(spec).await {
                Ok(result) if result.is_success() => {
                    debug!("policy command {} for {} succeeded", command_id, session_id);
                }
                Ok(result) => warn!(
                    "policy command {} for {} failed: {}",
                    command_id,
                    session_id,
                    result.error.unwrap_or_default()
                ),
                Err(err) => warn!(
                    "policy command {} for {} errored: {}",
                    command_id, session_id, err
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex as StdMutex;

    struct FixedSessions(Vec<TrackedSession>);

    impl SessionView for FixedSessions {
        fn sessions(&self) -> Vec<TrackedSession> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct RecordingIssuer {
        issued: StdMutex<Vec<CommandSpec>>,
    }

    #[async_trait]
    impl CommandIssuer for RecordingIssuer {
        async fn issue(&self, spec: CommandSpec) -> Result<CommandResultPayload, DispatchError> {
            let command_id = spec.command_id.clone().unwrap_or_default();
            self.issued.lock().unwrap().push(spec);
            Ok(CommandResultPayload::success(command_id, None))
        }
    }

    fn idle_session(idle_for_secs: i64) -> TrackedSession {
        let mut session = TrackedSession::new("s-idle", "node-1", "proj");
        session.status = SessionStatus::Idle;
        session.last_activity = Utc::now() - ChronoDuration::seconds(idle_for_secs);
        session
    }

    async fn engine_with(
        config: PoliciesConfig,
        sessions: Vec<TrackedSession>,
    ) -> (Arc<PolicyEngine>, Arc<RecordingIssuer>, Database) {
        let db = Database::in_memory().await.unwrap();
        let writer = Arc::new(
            SupervisorEventWriter::new(db.pool().clone())
                .await
                .unwrap(),
        );
        let issuer = Arc::new(RecordingIssuer::default());
        let engine = PolicyEngine::new(
            config,
            Arc::new(FixedSessions(sessions)),
            issuer.clone(),
            writer,
        );
        (engine, issuer, db)
    }

    fn config_with_idle_threshold(threshold: u64) -> PoliciesConfig {
        PoliciesConfig {
            resume_on_idle: ResumeOnIdleConfig {
                enabled: true,
                idle_threshold_sec: threshold,
                max_retries: 3,
                retry_reset_seconds: 1800,
                nudge_message: "keep going".to_string(),
            },
            restart_on_compaction: RestartOnCompactionConfig {
                enabled: false,
                ..Default::default()
            },
            kill_on_cost: KillOnCostConfig::default(),
            check_interval_sec: 60,
        }
    }

    #[tokio::test]
    async fn test_resume_on_idle_fires_and_audits() {
        let (engine, issuer, db) =
            engine_with(config_with_idle_threshold(1), vec![idle_session(10)]).await;

        engine.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (issued_kind, issued_message, issued_command_id) = {
            let issued = issuer.issued.lock().unwrap();
            assert_eq!(issued.len(), 1);
            (
                issued[0].kind,
                issued[0].args["message"].clone(),
                issued[0].command_id.clone().unwrap(),
            )
        };
        assert_eq!(issued_kind, CommandKind::PromptSession);
        assert_eq!(issued_message, json!("keep going"));

        let repo = crate::pipeline::EventRepository::new(db.pool().clone());
        let actions = repo.list_by_kind("policy.action").await.unwrap();
        assert_eq!(actions.len(), 1);
        let data: serde_json::Value = serde_json::from_str(&actions[0].data).unwrap();
        assert_eq!(data["rule"], json!(RULE_RESUME_ON_IDLE));
        assert_eq!(data["command_id"], json!(issued_command_id));
    }

    #[tokio::test]
    async fn test_fresh_session_does_not_fire() {
        let (engine, issuer, _db) =
            engine_with(config_with_idle_threshold(3600), vec![idle_session(10)]).await;

        engine.tick().await;
        assert!(issuer.issued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_cap_latches() {
        let (engine, issuer, _db) =
            engine_with(config_with_idle_threshold(1), vec![idle_session(100)]).await;

        for _ in 0..10 {
            engine.tick().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // max_retries = 3: further ticks stay quiet until the reset window.
        assert_eq!(issuer.issued.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_restart_on_compaction_threshold() {
        let mut session = TrackedSession::new("s-full", "node-1", "proj");
        session.tokens = 200_000;

        let config = PoliciesConfig {
            resume_on_idle: ResumeOnIdleConfig {
                enabled: false,
                ..Default::default()
            },
            restart_on_compaction: RestartOnCompactionConfig {
                enabled: true,
                token_threshold: 150_000,
                max_retries: 1,
                retry_reset_seconds: 1800,
            },
            ..Default::default()
        };
        let (engine, issuer, _db) = engine_with(config, vec![session]).await;

        engine.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let issued = issuer.issued.lock().unwrap();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].kind, CommandKind::RestartSession);
    }

    #[tokio::test]
    async fn test_kill_on_cost_requires_opt_in() {
        let mut session = TrackedSession::new("s-pricey", "node-1", "proj");
        session.cost = 100.0;

        let config = PoliciesConfig {
            resume_on_idle: ResumeOnIdleConfig {
                enabled: false,
                ..Default::default()
            },
            restart_on_compaction: RestartOnCompactionConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let (engine, issuer, _db) = engine_with(config, vec![session.clone()]).await;
        engine.tick().await;
        assert!(issuer.issued.lock().unwrap().is_empty(), "disabled by default");

        let config = PoliciesConfig {
            resume_on_idle: ResumeOnIdleConfig {
                enabled: false,
                ..Default::default()
            },
            restart_on_compaction: RestartOnCompactionConfig {
                enabled: false,
                ..Default::default()
            },
            kill_on_cost: KillOnCostConfig {
                enabled: true,
                cost_threshold: 50.0,
                max_retries: 1,
                retry_reset_seconds: 1800,
            },
            ..Default::default()
        };
        let (engine, issuer, _db) = engine_with(config, vec![session]).await;
        engine.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let issued = issuer.issued.lock().unwrap();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].kind, CommandKind::KillSession);
    }
}
