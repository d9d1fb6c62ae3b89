use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, info};
use tokio_util::sync::CancellationToken;

use swarm_agent::ConfigError;
use swarm_agent::authwatch::{ToolPathBroker, spawn_auth_reporter};
use swarm_agent::config::AgentConfig;
use swarm_agent::credentials::CredentialStore;
use swarm_agent::engine::RestSessionEngine;
use swarm_agent::handlers::{ConfigUpdateHandler, CredentialSyncHook, register_handlers};
use swarm_agent::link::{AgentLink, LinkConfig, spawn_heartbeat};
use swarm_agent::state::AgentState;

fn main() {
    let code = match try_main() {
        Ok(()) => 0,
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            if err.is::<ConfigError>() { 1 } else { 2 }
        }
    };
    std::process::exit(code);
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    match cli.command {
        Command::Serve(cmd) => async_serve(cli.common, cmd),
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Swarm agent - per-host session daemon.")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the supervisor and serve local sessions
    Serve(ServeCommand),
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the supervisor WebSocket URL
    #[arg(long, value_name = "URL")]
    supervisor_url: Option<String>,
    /// Override the node id
    #[arg(long, value_name = "ID")]
    node_id: Option<String>,
}

fn init_logging(common: &CommonOpts) {
    let level = if common.debug || common.verbose >= 2 {
        LevelFilter::Debug
    } else if common.quiet {
        LevelFilter::Error
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn async_serve(common: CommonOpts, cmd: ServeCommand) -> Result<()> {
    let mut config = AgentConfig::load(common.config.as_deref())?;
    if let Some(url) = cmd.supervisor_url {
        config.supervisor_url = url;
    }
    if let Some(node_id) = cmd.node_id {
        config.node_id = Some(node_id);
    }

    let node_id = config.effective_node_id();
    info!("starting agent {} ({} projects)", node_id, config.projects.len());

    let state = Arc::new(AgentState::new(swarm_agent::config::hostname()));
    let engine = Arc::new(RestSessionEngine::new(config.opencode_port));
    let credentials = Arc::new(CredentialStore::new());
    let broker = Arc::new(ToolPathBroker::new(&config.tool_paths));

    let project_names: Vec<String> = config.projects.iter().map(|p| p.name.clone()).collect();
    let link = AgentLink::new(
        LinkConfig::new(&config.supervisor_url, &config.auth_token, &node_id)
            .with_projects(project_names),
    );

    link.set_snapshot_provider(state.clone());
    register_handlers(
        &link,
        state,
        engine,
        credentials.clone(),
        broker.clone(),
        config.projects.clone(),
    );
    link.add_connect_hook(Arc::new(CredentialSyncHook {
        node_id: node_id.clone(),
        credentials,
    }));

    let heartbeat_interval = Arc::new(AtomicU64::new(config.heartbeat_interval_sec));
    link.set_message_handler(Arc::new(ConfigUpdateHandler {
        heartbeat_interval_sec: heartbeat_interval.clone(),
    }));

    let cancel = CancellationToken::new();
    link.connect();
    let heartbeat = spawn_heartbeat(link.clone(), heartbeat_interval, cancel.child_token());
    let auth_reporter = spawn_auth_reporter(
        link.clone(),
        broker,
        std::time::Duration::from_secs(config.auth_report_interval_sec.max(1)),
        cancel.child_token(),
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    link.close().await;
    heartbeat.stop().await;
    let _ = auth_reporter.await;

    Ok(())
}
