//! Supervisor configuration.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ConfigError;
use crate::hub::HubConfig;
use crate::policy::PoliciesConfig;

fn default_port() -> u16 {
    9190
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout_count() -> u32 {
    3
}

fn default_db_path() -> PathBuf {
    PathBuf::from("swarm.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port serving the agent WebSocket endpoint (and /health).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional second port serving only /health; 0 disables it.
    #[serde(default)]
    pub http_port: u16,
    /// Shared token agents must present. Required.
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_sec: u64,
    /// Sub-second override for the heartbeat interval; takes precedence
    /// over `heartbeat_interval_sec` when set. Test instrumentation.
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default = "default_heartbeat_timeout_count")]
    pub heartbeat_timeout_count: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            http_port: 0,
            auth_token: String::new(),
            heartbeat_interval_sec: default_heartbeat_interval(),
            heartbeat_interval_ms: None,
            heartbeat_timeout_count: default_heartbeat_timeout_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub tls: TlsConfig,
    /// Origin allow-list for upgrade requests; empty accepts all.
    #[serde(default)]
    pub origin_allowlist: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub policies: PoliciesConfig,
}

impl Settings {
    /// Load from an optional TOML file with `SWARMD_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(Environment::with_prefix("SWARMD").separator("__"));

        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError(format!("loading supervisor config: {e}")))
            .context("supervisor configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.auth_token.is_empty() {
            return Err(ConfigError("server.auth_token is required".to_string()).into());
        }
        if self.server.heartbeat_interval_sec == 0 {
            return Err(
                ConfigError("server.heartbeat_interval_sec must be positive".to_string()).into(),
            );
        }
        if self.security.tls.enabled {
            // Nothing in this stack terminates TLS in-process; front the
            // daemon with a proxy instead.
            return Err(ConfigError(
                "security.tls.enabled is not supported; terminate TLS at a fronting proxy"
                    .to_string(),
            )
            .into());
        }
        Ok(())
    }

    pub fn hub_config(&self) -> HubConfig {
        let heartbeat_interval = match self.server.heartbeat_interval_ms {
            Some(ms) => Duration::from_millis(ms.max(1)),
            None => Duration::from_secs(self.server.heartbeat_interval_sec),
        };
        HubConfig {
            auth_token: self.server.auth_token.clone(),
            origin_allowlist: self.security.origin_allowlist.clone(),
            heartbeat_interval,
            heartbeat_timeout_count: self.server.heartbeat_timeout_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9999
auth_token = "secret"
heartbeat_interval_sec = 10
heartbeat_timeout_count = 2

[database]
path = "/tmp/swarm-test.db"

[security]
origin_allowlist = ["https://*.example.com"]

[policies.resume_on_idle]
enabled = true
idle_threshold_sec = 120
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.server.port, 9999);
        assert_eq!(settings.hub_config().heartbeat_grace(), Duration::from_secs(20));
        assert_eq!(settings.policies.resume_on_idle.idle_threshold_sec, 120);
        assert_eq!(settings.policies.check_interval_sec, 60);
    }

    #[test]
    fn test_missing_token_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[server]\nport = 9999").unwrap();

        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(err.is::<ConfigError>());
    }

    #[test]
    fn test_tls_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[server]\nauth_token = \"t\"\n[security.tls]\nenabled = true"
        )
        .unwrap();

        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(err.is::<ConfigError>());
    }
}
