//! Agent daemon configuration.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

use crate::ConfigError;

/// A project this agent owns.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub directory: String,
}

/// Paths to the external tools whose auth state the agent reports.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolPaths {
    #[serde(default)]
    pub opencode: Option<String>,
    #[serde(default)]
    pub claude: Option<String>,
    #[serde(default)]
    pub codex: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// WebSocket URL of the supervisor, e.g. `ws://supervisor:9190/ws/agent`.
    pub supervisor_url: String,
    /// Shared token; must match the supervisor's.
    pub auth_token: String,
    /// Stable node identity. Defaults to the host name.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Port of the local session engine.
    #[serde(default = "default_opencode_port")]
    pub opencode_port: u16,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "default_auth_report_interval")]
    pub auth_report_interval_sec: u64,
    #[serde(default)]
    pub tool_paths: ToolPaths,
}

fn default_opencode_port() -> u16 {
    4096
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_auth_report_interval() -> u64 {
    300
}

impl AgentConfig {
    /// Load from an optional TOML file with `SWARM_AGENT_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(Environment::with_prefix("SWARM_AGENT").separator("__"));

        let settings: AgentConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError(format!("loading agent config: {e}")))
            .context("agent configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor_url.is_empty() {
            return Err(ConfigError("supervisor_url is required".to_string()).into());
        }
        if self.auth_token.is_empty() {
            return Err(ConfigError("auth_token is required".to_string()).into());
        }
        if self.heartbeat_interval_sec == 0 {
            return Err(ConfigError("heartbeat_interval_sec must be positive".to_string()).into());
        }
        Ok(())
    }

    /// The configured node id, falling back to the OS host name.
    pub fn effective_node_id(&self) -> String {
        if let Some(id) = &self.node_id {
            if !id.is_empty() {
                return id.clone();
            }
        }
        hostname()
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// Best-effort OS host name.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
supervisor_url = "ws://127.0.0.1:9190/ws/agent"
auth_token = "secret"
node_id = "agent-1"

[[projects]]
name = "proj-a"
directory = "/srv/proj-a"

[tool_paths]
opencode = "/usr/local/bin/opencode"
"#
        )
        .unwrap();

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.effective_node_id(), "agent-1");
        assert_eq!(config.heartbeat_interval_sec, 30);
        assert_eq!(config.project("proj-a").unwrap().directory, "/srv/proj-a");
        assert_eq!(
            config.tool_paths.opencode.as_deref(),
            Some("/usr/local/bin/opencode")
        );
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
supervisor_url = "ws://127.0.0.1:9190/ws/agent"
auth_token = ""
"#
        )
        .unwrap();

        let err = AgentConfig::load(Some(file.path())).unwrap_err();
        assert!(err.is::<ConfigError>() || err.chain().any(|c| c.is::<ConfigError>()));
    }
}
