//! WebSocket upgrade handler for agent connections.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use super::Hub;
use super::origin::origin_allowed;

/// Identity derived from the upgrade request before any frame flows.
#[derive(Debug, Clone)]
pub struct ConnIdentity {
    pub node_id: String,
    pub hostname: String,
    pub projects: Vec<String>,
}

impl ConnIdentity {
    pub fn derive(headers: &HeaderMap, params: &HashMap<String, String>) -> Self {
        let node_id = headers
            .get("x-node-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .or_else(|| params.get("node_id").cloned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                format!(
                    "host-{}",
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_nanos())
                        .unwrap_or_default()
                )
            });

        let hostname = params.get("hostname").cloned().unwrap_or_default();

        let projects = params
            .get("projects")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            node_id,
            hostname,
            projects,
        }
    }
}

/// GET /ws/agent
pub async fn ws_handler(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&hub, &headers, &params) {
        warn!("rejected agent upgrade: bad or missing token");
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    if !origin_allowed(&hub.config().origin_allowlist, origin.as_deref()) {
        warn!("rejected agent upgrade: origin {:?} not allowed", origin);
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let identity = ConnIdentity::derive(&headers, &params);
    info!("agent upgrade accepted for node {}", identity.node_id);

    ws.on_upgrade(move |socket| async move {
        hub.accept(socket, identity).await;
    })
}

/// Token from `Authorization: Bearer …` or `?token=…`; both are accepted.
fn authorized(hub: &Hub, headers: &HeaderMap, params: &HashMap<String, String>) -> bool {
    let expected = &hub.config().auth_token;
    if expected.is_empty() {
        return false;
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if bearer == Some(expected.as_str()) {
        return true;
    }

    params.get("token").map(|t| t.as_str()) == Some(expected.as_str())
}
