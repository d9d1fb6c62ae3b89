use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use swarmd::ConfigError;
use swarmd::settings::Settings;

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
        Command::CheckConfig => {
            let _ = Settings::load(cli.common.config.as_deref())?;
            println!("configuration ok");
            Ok(())
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Swarm supervisor - fleet control plane.")]
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
    /// Run the supervisor
    Serve(ServeCommand),
    /// Validate the configuration and exit
    CheckConfig,
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the listen port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,
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
    let mut settings = Settings::load(common.config.as_deref())?;
    if let Some(port) = cmd.port {
        settings.server.port = port;
    }
    swarmd::server::serve(settings).await
}
