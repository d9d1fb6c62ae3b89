//! Shared harness for supervisor integration tests: a real supervisor on
//! an ephemeral port plus a real agent built from the agent crate with a
//! fake session engine.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use swarmd::db::Database;
use swarmd::server::Supervisor;
use swarmd::settings::Settings;

use swarm_agent::authwatch::ToolPathBroker;
use swarm_agent::backoff::BackoffConfig;
use swarm_agent::config::{ProjectConfig, ToolPaths};
use swarm_agent::credentials::CredentialStore;
use swarm_agent::engine::fake::FakeEngine;
use swarm_agent::handlers::register_handlers;
use swarm_agent::link::{AgentLink, LinkConfig};
use swarm_agent::state::AgentState;

pub const TOKEN: &str = "test-token";

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.auth_token = TOKEN.to_string();
    settings
}

pub struct TestServer {
    pub supervisor: Supervisor,
    pub addr: SocketAddr,
    serve_task: JoinHandle<()>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/agent", self.addr)
    }

    pub async fn stop(mut self) {
        self.serve_task.abort();
        let _ = self.serve_task.await;
        self.supervisor.shutdown().await;
    }
}

pub async fn start_server(settings: Settings, db: Database) -> TestServer {
    start_server_bound(settings, db, None).await
}

/// Bind to a specific address when a restarted supervisor must come back
/// where the agents are still dialing.
pub async fn start_server_bound(
    settings: Settings,
    db: Database,
    addr: Option<SocketAddr>,
) -> TestServer {
    let mut supervisor = Supervisor::build(&settings, db).await.expect("build supervisor");
    supervisor.start();

    let bind = addr.unwrap_or_else(|| "127.0.0.1:0".parse().expect("bind addr"));
    let listener = TcpListener::bind(bind).await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");

    let app = supervisor.router();
    let serve_task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        supervisor,
        addr,
        serve_task,
    }
}

pub struct TestAgent {
    pub link: Arc<AgentLink>,
    pub state: Arc<AgentState>,
    pub engine: Arc<FakeEngine>,
    pub credentials: Arc<CredentialStore>,
}

impl TestAgent {
    pub async fn stop(&self) {
        self.link.close().await;
    }
}

/// Build and connect a full agent (link + handlers + fake engine) for
/// `node_id`, owning the project `proj-a`.
pub fn start_agent(addr: SocketAddr, node_id: &str) -> TestAgent {
    let link = AgentLink::with_backoff(
        LinkConfig::new(format!("ws://{}/ws/agent", addr), TOKEN, node_id)
            .with_projects(vec!["proj-a".to_string()]),
        BackoffConfig {
            min: Duration::from_millis(20),
            max: Duration::from_millis(200),
            factor: 2.0,
            jitter: 0.0,
        },
    );

    let state = Arc::new(AgentState::new("test-host"));
    let engine = Arc::new(FakeEngine::new());
    let credentials = Arc::new(CredentialStore::new());

    link.set_snapshot_provider(state.clone());
    register_handlers(
        &link,
        state.clone(),
        engine.clone(),
        credentials.clone(),
        Arc::new(ToolPathBroker::new(&ToolPaths::default())),
        vec![ProjectConfig {
            name: "proj-a".to_string(),
            directory: "/tmp/proj-a".to_string(),
        }],
    );
    link.connect();

    TestAgent {
        link,
        state,
        engine,
        credentials,
    }
}

/// Poll `predicate` every 10 ms until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
