//! Credential bundle application with at-most-once semantics.
//!
//! The supervisor pushes env-var bundles inside `credential_push` commands.
//! Application is keyed by command id so a resent command never double
//! applies, and stale bundle versions lose to newer ones regardless of
//! arrival order.

use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use swarm_protocol::CredentialPayload;

/// Upper bound on remembered command ids; overflow evicts oldest first.
const APPLIED_ID_CAP: usize = 1000;

/// Placeholder substituted for secret values in log output.
pub const REDACTED: &str = "[REDACTED]";

/// Outcome of an [`CredentialStore::apply_if_new`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The bundle replaced the current env map.
    Applied,
    /// This command id was seen before; nothing changed.
    AlreadyApplied,
    /// The bundle's version is older than the stored one; nothing changed.
    Stale,
}

#[derive(Debug, Default)]
struct Inner {
    env: HashMap<String, String>,
    version: u64,
    applied_order: VecDeque<String>,
    applied: HashSet<String>,
}

/// Agent-local credential state. All mutation is serialized through one
/// lock; getters hand out copies so callers cannot reach internal state.
#[derive(Debug, Default)]
pub struct CredentialStore {
    inner: Mutex<Inner>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and apply a bundle, replacing the env map wholesale.
    pub fn apply(&self, payload: &CredentialPayload) -> Result<ApplyOutcome> {
        validate(payload)?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(apply_locked(&mut inner, payload))
    }

    /// Apply a bundle unless this `command_id` was already applied.
    pub fn apply_if_new(&self, command_id: &str, payload: &CredentialPayload) -> Result<ApplyOutcome> {
        validate(payload)?;
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.applied.contains(command_id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        inner.applied.insert(command_id.to_string());
        inner.applied_order.push_back(command_id.to_string());
        while inner.applied_order.len() > APPLIED_ID_CAP {
            if let Some(evicted) = inner.applied_order.pop_front() {
                inner.applied.remove(&evicted);
            }
        }

        Ok(apply_locked(&mut inner, payload))
    }

    /// Copy of the current env map.
    pub fn get_env(&self) -> HashMap<String, String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .env
            .clone()
    }

    /// Current bundle version.
    pub fn get_version(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).version
    }

    /// Redact `value` iff it exactly equals any stored credential value.
    /// Called on every string destined for a log record on the credential
    /// path so secrets never reach structured logs.
    pub fn mask_value(&self, value: &str) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.env.values().any(|v| v == value) {
            REDACTED.to_string()
        } else {
            value.to_string()
        }
    }
}

fn apply_locked(inner: &mut Inner, payload: &CredentialPayload) -> ApplyOutcome {
    if payload.version < inner.version {
        return ApplyOutcome::Stale;
    }
    inner.env = payload.env_vars.clone();
    inner.version = payload.version;
    ApplyOutcome::Applied
}

fn validate(payload: &CredentialPayload) -> Result<()> {
    if payload.target_node.is_empty() {
        bail!("credential bundle missing target_node");
    }
    if payload.env_vars.is_empty() {
        bail!("credential bundle has no env vars");
    }
    for (name, value) in &payload.env_vars {
        if name.is_empty() || value.is_empty() {
            bail!("credential bundle has an empty env var name or value");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(version: u64, key: &str, value: &str) -> CredentialPayload {
        CredentialPayload {
            target_node: "agent-1".to_string(),
            env_vars: HashMap::from([(key.to_string(), value.to_string())]),
            version,
        }
    }

    #[test]
    fn test_apply_replaces_wholesale() {
        let store = CredentialStore::new();
        store.apply(&bundle(1, "OPENAI_API_KEY", "key-v1")).unwrap();

        let mut second = bundle(2, "ANTHROPIC_API_KEY", "key-a");
        second
            .env_vars
            .insert("EXTRA".to_string(), "x".to_string());
        store.apply(&second).unwrap();

        let env = store.get_env();
        assert_eq!(env.len(), 2);
        assert!(!env.contains_key("OPENAI_API_KEY"));
        assert_eq!(store.get_version(), 2);
    }

    #[test]
    fn test_duplicate_command_id_is_rejected() {
        let store = CredentialStore::new();

        let outcome = store
            .apply_if_new("cmd-1", &bundle(1, "OPENAI_API_KEY", "key-v1"))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        // Same command id with different contents must not mutate.
        let outcome = store
            .apply_if_new("cmd-1", &bundle(2, "OPENAI_API_KEY", "key-v2"))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyApplied);

        assert_eq!(store.get_env()["OPENAI_API_KEY"], "key-v1");
        assert_eq!(store.get_version(), 1);
    }

    #[test]
    fn test_stale_version_loses() {
        let store = CredentialStore::new();
        store
            .apply_if_new("cmd-2", &bundle(2, "KEY", "newer"))
            .unwrap();

        let outcome = store
            .apply_if_new("cmd-1", &bundle(1, "KEY", "older"))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(store.get_env()["KEY"], "newer");
        assert_eq!(store.get_version(), 2);
    }

    #[test]
    fn test_idempotent_replay() {
        let store = CredentialStore::new();
        let payload = bundle(3, "KEY", "v3");

        for _ in 0..5 {
            store.apply_if_new("cmd-3", &payload).unwrap();
        }

        assert_eq!(store.get_env()["KEY"], "v3");
        assert_eq!(store.get_version(), 3);
    }

    #[test]
    fn test_applied_set_is_bounded() {
        let store = CredentialStore::new();
        for i in 0..(APPLIED_ID_CAP + 10) {
            let id = format!("cmd-{}", i);
            store
                .apply_if_new(&id, &bundle(i as u64 + 1, "KEY", "v"))
                .unwrap();
        }

        // Oldest ids were evicted, so re-applying the first id works again.
        let outcome = store
            .apply_if_new("cmd-0", &bundle(5000, "KEY", "v"))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[test]
    fn test_validation() {
        let store = CredentialStore::new();

        let mut no_target = bundle(1, "KEY", "v");
        no_target.target_node.clear();
        assert!(store.apply(&no_target).is_err());

        let empty_vars = CredentialPayload {
            target_node: "agent-1".to_string(),
            env_vars: HashMap::new(),
            version: 1,
        };
        assert!(store.apply(&empty_vars).is_err());

        let empty_value = bundle(1, "KEY", "");
        assert!(store.apply(&empty_value).is_err());
    }

    #[test]
    fn test_mask_value() {
        let store = CredentialStore::new();
        store.apply(&bundle(1, "OPENAI_API_KEY", "sk-secret")).unwrap();

        assert_eq!(store.mask_value("sk-secret"), REDACTED);
        assert_eq!(store.mask_value("sk-secre"), "sk-secre");
        assert_eq!(store.mask_value("something else"), "something else");
    }
}
