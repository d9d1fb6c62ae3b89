//! Process wiring: build the components, hand each the capability slices
//! it needs, and serve the WebSocket and health endpoints.

use anyhow::{Context, Result};
use axum::{Json, Router, routing::get};
use log::info;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ConfigError;
use crate::db::Database;
use crate::dispatch::CommandDispatcher;
use crate::hub::{Hub, MessageObserver, ws_handler};
use crate::pipeline::{EventPipeline, SupervisorEventWriter};
use crate::policy::PolicyEngine;
use crate::registry::NodeRegistry;
use crate::settings::Settings;
use crate::tracker::{SessionTracker, spawn_tracker_updates};

/// All supervisor components, wired. The process (and the integration
/// tests) own the concretes; everything else sees narrow traits.
pub struct Supervisor {
    pub db: Database,
    pub hub: Arc<Hub>,
    pub registry: Arc<NodeRegistry>,
    pub tracker: Arc<SessionTracker>,
    pub pipeline: Arc<EventPipeline>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub policy: Arc<PolicyEngine>,
    pub events: Arc<SupervisorEventWriter>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub async fn build(settings: &Settings, db: Database) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new(db.pool().clone()));
        registry.load_from_db().await?;

        let tracker = Arc::new(SessionTracker::new(db.pool().clone()));
        tracker.load_from_db().await?;

        let events = Arc::new(SupervisorEventWriter::new(db.pool().clone()).await?);
        let pipeline = Arc::new(EventPipeline::new(db.pool().clone(), events.clone()));
        pipeline.load_from_db().await?;

        let cancel = CancellationToken::new();
        let hub = Hub::new(
            settings.hub_config(),
            registry.clone(),
            tracker.clone(),
            pipeline.clone(),
            cancel.clone(),
        );

        let dispatcher = Arc::new(CommandDispatcher::new(
            db.pool().clone(),
            hub.clone(),
            registry.clone(),
        ));
        hub.set_result_sink(dispatcher.clone());

        let policy = PolicyEngine::new(
            settings.policies.clone(),
            tracker.clone(),
            dispatcher.clone(),
            events.clone(),
        );

        hub.add_observer(Arc::new(StateReportObserver));

        Ok(Self {
            db,
            hub,
            registry,
            tracker,
            pipeline,
            dispatcher,
            policy,
            events,
            cancel,
            tasks: Vec::new(),
        })
    }

    /// Start the background loops: heartbeat monitor, tracker updates,
    /// policy scans.
    pub fn start(&mut self) {
        self.tasks.push(self.hub.clone().spawn_monitor());
        self.tasks.push(spawn_tracker_updates(
            self.tracker.clone(),
            self.pipeline.subscribe(),
            self.cancel.child_token(),
        ));
        self.tasks
            .push(self.policy.clone().spawn(self.cancel.child_token()));
    }

    pub fn router(&self) -> Router {
        router(self.hub.clone())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.hub.close_all();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Surfaces agent-side state reports (`credential_sync`, `auth_state`)
/// in the supervisor log so operators can see stale credentials and
/// broken tool auth without another surface.
struct StateReportObserver;

#[async_trait::async_trait]
impl MessageObserver for StateReportObserver {
    async fn observe(&self, node_id: &str, envelope: &swarm_protocol::Envelope) {
        match envelope.kind.as_str() {
            swarm_protocol::kind::CREDENTIAL_SYNC => {
                match envelope.payload_as::<swarm_protocol::CredentialSyncPayload>() {
                    Ok(sync) => info!(
                        "node {} reports credential version {}",
                        node_id, sync.credential_version
                    ),
                    Err(err) => log::warn!("node {}: bad credential_sync payload: {}", node_id, err),
                }
            }
            swarm_protocol::kind::AUTH_STATE => {
                match envelope.payload_as::<swarm_protocol::AuthStatePayload>() {
                    Ok(state) => {
                        for status in state.statuses {
                            info!(
                                "node {} tool {} auth {}{}",
                                node_id,
                                status.tool,
                                status.status,
                                status
                                    .reason
                                    .map(|r| format!(" ({})", r))
                                    .unwrap_or_default()
                            );
                        }
                    }
                    Err(err) => log::warn!("node {}: bad auth_state payload: {}", node_id, err),
                }
            }
            _ => {}
        }
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/agent", get(ws_handler))
        .with_state(hub)
}

fn health_router() -> Router {
    Router::new().route("/health", get(health))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Run the supervisor until a shutdown signal.
pub async fn serve(settings: Settings) -> Result<()> {
    let db = Database::new(&settings.database.path)
        .await
        .map_err(|e| ConfigError(format!("opening store: {e:#}")))?;

    let mut supervisor = Supervisor::build(&settings, db).await?;
    supervisor.start();
    let cancel = supervisor.cancel_token();

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("supervisor listening on {}", addr);

    if settings.server.http_port != 0 && settings.server.http_port != settings.server.port {
        let health_addr = SocketAddr::from(([0, 0, 0, 0], settings.server.http_port));
        let health_listener = TcpListener::bind(health_addr)
            .await
            .with_context(|| format!("binding {}", health_addr))?;
        info!("health endpoint on {}", health_addr);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = axum::serve(health_listener, health_router())
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await;
        });
    }

    let shutdown_cancel = cancel.clone();
    let server = axum::serve(listener, supervisor.router()).with_graceful_shutdown(async move {
        tokio::select! {
            _ = shutdown_cancel.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    log::warn!("signal listener failed: {}", err);
                }
            }
        }
    });

    server.await.context("serving")?;
    info!("shutting down");
    supervisor.shutdown().await;
    Ok(())
}
