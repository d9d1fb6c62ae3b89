//! Tool authentication probing and reporting.
//!
//! The agent periodically reports the auth state of the external tools it
//! wraps, and serves `oauth_trigger` commands through the same seam. The
//! subprocess adapters that actually run `<tool> login` flows live outside
//! this crate; [`ToolPathBroker`] covers the probe side well enough for a
//! fleet dashboard.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use log::{debug, warn};
use swarm_protocol::{AuthStatePayload, Envelope, ToolAuthStatus, kind};

use crate::config::ToolPaths;
use crate::link::AgentLink;

/// Result of an oauth trigger attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthOutcome {
    pub status: OauthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OauthStatus {
    Challenge,
    Success,
    Failure,
    ManualRequired,
}

/// Seam to tool auth checks and login flows.
#[async_trait]
pub trait AuthBroker: Send + Sync {
    /// Auth status of every known tool.
    async fn probe(&self) -> Vec<ToolAuthStatus>;

    /// Kick off an authentication flow for one tool.
    async fn trigger(&self, tool: &str) -> OauthOutcome;
}

/// Broker that knows the configured tool binaries. A tool whose binary is
/// present reports `unverified` (a real check needs the tool's own CLI); a
/// missing binary reports `missing`. Login flows require an operator at
/// the host today.
pub struct ToolPathBroker {
    tools: HashMap<String, String>,
}

impl ToolPathBroker {
    pub fn new(paths: &ToolPaths) -> Self {
        let mut tools = HashMap::new();
        if let Some(path) = &paths.opencode {
            tools.insert("opencode".to_string(), path.clone());
        }
        if let Some(path) = &paths.claude {
            tools.insert("claude".to_string(), path.clone());
        }
        if let Some(path) = &paths.codex {
            tools.insert("codex".to_string(), path.clone());
        }
        Self { tools }
    }
}

#[async_trait]
impl AuthBroker for ToolPathBroker {
    async fn probe(&self) -> Vec<ToolAuthStatus> {
        let mut statuses: Vec<ToolAuthStatus> = self
            .tools
            .iter()
            .map(|(tool, path)| {
                let present = std::path::Path::new(path).exists();
                ToolAuthStatus {
                    tool: tool.clone(),
                    status: if present { "unverified" } else { "missing" }.to_string(),
                    reason: (!present).then(|| format!("binary not found at {}", path)),
                    checked_at: swarm_protocol::unix_now(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.tool.cmp(&b.tool));
        statuses
    }

    async fn trigger(&self, tool: &str) -> OauthOutcome {
        if self.tools.contains_key(tool) {
            OauthOutcome {
                status: OauthStatus::ManualRequired,
                challenge_url: None,
                user_code: None,
                reason: Some(format!("{} login must be run on the host", tool)),
            }
        } else {
            OauthOutcome {
                status: OauthStatus::Failure,
                challenge_url: None,
                user_code: None,
                reason: Some(format!("unknown tool: {}", tool)),
            }
        }
    }
}

/// Periodically probe and report `auth_state` to the supervisor.
pub fn spawn_auth_reporter(
    link: Arc<AgentLink>,
    broker: Arc<dyn AuthBroker>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let payload = AuthStatePayload {
                statuses: broker.probe().await,
            };
            let envelope = match Envelope::new(kind::AUTH_STATE, &payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!("failed to build auth_state envelope: {}", err);
                    continue;
                }
            };
            if let Err(err) = link.send_envelope(envelope).await {
                debug!("auth_state report skipped: {}", err);
            }
        }
    })
}
