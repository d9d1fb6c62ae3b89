//! Per-host agent daemon for the swarm control plane.
//!
//! The agent owns the projects and sessions on one host, wraps the local
//! session engine, and keeps a single authenticated WebSocket link to the
//! supervisor: snapshot on connect, sequenced events with buffered resend,
//! and idempotent command handling.

pub mod authwatch;
pub mod backoff;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod handlers;
pub mod link;
pub mod state;

use thiserror::Error;

/// Startup failure that should exit with code 1 instead of 2.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);
