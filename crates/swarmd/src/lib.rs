//! Supervisor daemon for the swarm control plane.
//!
//! Maintains a live view of every agent, session, and event in the
//! fleet; accepts and audits operator commands; applies intervention
//! policies; and persists the whole history to an embedded SQLite store.

pub mod db;
pub mod dispatch;
pub mod hub;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod server;
pub mod settings;
pub mod tracker;

use thiserror::Error;

/// Startup failure that should exit with code 1 instead of 2.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);
