//! Session engine seam.
//!
//! The agent drives one external coding tool per host through its REST
//! API. Handlers talk to the [`SessionEngine`] trait; the REST
//! implementation below is the production wiring and tests substitute an
//! in-memory fake.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;

/// The contract the command handlers need from the session engine.
#[async_trait]
pub trait SessionEngine: Send + Sync {
    /// Create a session in `directory`, optionally seeding it with a
    /// prompt. Returns the engine-assigned session id.
    async fn create_session(&self, directory: &str, prompt: Option<&str>) -> Result<String>;

    /// Send a message to a running session.
    async fn prompt_session(&self, session_id: &str, message: &str) -> Result<()>;

    /// Terminate a session.
    async fn kill_session(&self, session_id: &str) -> Result<()>;

    /// Current status string for a session.
    async fn session_status(&self, session_id: &str) -> Result<String>;
}

/// REST client for a locally running session engine.
pub struct RestSessionEngine {
    base_url: String,
    client: reqwest::Client,
}

impl RestSessionEngine {
    pub fn new(port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SessionEngine for RestSessionEngine {
    async fn create_session(&self, directory: &str, prompt: Option<&str>) -> Result<String> {
        let mut body = json!({});
        if let Some(prompt) = prompt {
            body["prompt"] = json!(prompt);
        }

        let response = self
            .client
            .post(format!("{}/session", self.base_url))
            .header("x-project-directory", directory)
            .json(&body)
            .send()
            .await
            .context("creating session")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("failed to create session: {} - {}", status, body);
        }

        let created: serde_json::Value = response.json().await.context("decoding session id")?;
        created["id"]
            .as_str()
            .map(|s| s.to_string())
            .context("session engine returned no id")
    }

    async fn prompt_session(&self, session_id: &str, message: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/session/{}/message", self.base_url, session_id))
            .json(&json!({ "message": message }))
            .send()
            .await
            .context("sending prompt")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("failed to prompt session: {} - {}", status, body);
        }
        Ok(())
    }

    async fn kill_session(&self, session_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/session/{}", self.base_url, session_id))
            .send()
            .await
            .context("killing session")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("failed to kill session: {} - {}", status, body);
        }
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/session/{}/status", self.base_url, session_id))
            .send()
            .await
            .context("fetching session status")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("failed to fetch session status: {} - {}", status, body);
        }

        let status: serde_json::Value = response.json().await.context("decoding status")?;
        status["status"]
            .as_str()
            .map(|s| s.to_string())
            .context("session engine returned no status")
    }
}

/// In-memory engine used by unit and integration tests.
#[cfg(any(test, feature = "test-engine"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    pub struct FakeEngine {
        next_id: AtomicU64,
        pub sessions: Mutex<HashMap<String, String>>,
    }

    impl FakeEngine {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SessionEngine for FakeEngine {
        async fn create_session(&self, _directory: &str, _prompt: Option<&str>) -> Result<String> {
            let id = format!("eng-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            self.sessions
                .lock()
                .unwrap()
                .insert(id.clone(), "running".to_string());
            Ok(id)
        }

        async fn prompt_session(&self, session_id: &str, _message: &str) -> Result<()> {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get_mut(session_id) {
                Some(status) => {
                    *status = "running".to_string();
                    Ok(())
                }
                None => bail!("unknown session: {}", session_id),
            }
        }

        async fn kill_session(&self, session_id: &str) -> Result<()> {
            match self.sessions.lock().unwrap().remove(session_id) {
                Some(_) => Ok(()),
                None => bail!("unknown session: {}", session_id),
            }
        }

        async fn session_status(&self, session_id: &str) -> Result<String> {
            match self.sessions.lock().unwrap().get(session_id) {
                Some(status) => Ok(status.clone()),
                None => bail!("unknown session: {}", session_id),
            }
        }
    }
}
