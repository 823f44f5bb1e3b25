// ABOUTME: Command line entry point for the dockformer binary
// ABOUTME: Parses flags, loads configuration and dispatches to serve, validate or plan

use clap::{Parser, Subcommand};
use colored::*;
use dockformer_cli::{commands, logging, Config, RuntimeKind};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "dockformer")]
#[command(about = "DockFormer - declarative container orchestration from a YAML manifest")]
#[command(version)]
struct Cli {
    /// Container runtime backend
    #[arg(long, global = true, value_enum, env = "DOCKFORMER_RUNTIME")]
    runtime: Option<RuntimeKind>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and background reconciliation (default)
    Serve {
        /// Address to bind
        #[arg(long, env = "DOCKFORMER_BIND")]
        bind: Option<std::net::IpAddr>,
        /// Port to listen on
        #[arg(short, long, env = "DOCKFORMER_PORT")]
        port: Option<u16>,
        /// Path of the manifest database
        #[arg(long, env = "DOCKFORMER_DB_PATH")]
        db_path: Option<PathBuf>,
    },
    /// Parse a manifest file and list its containers
    Validate {
        file: PathBuf,
    },
    /// Show what applying a manifest would change, without applying it
    Plan {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(runtime) = cli.runtime {
        config.runtime = runtime;
    }
    config.log_json |= cli.log_json;

    logging::init_tracing(&config.log_level, config.log_json);

    match cli.command.unwrap_or(Commands::Serve {
        bind: None,
        port: None,
        db_path: None,
    }) {
        Commands::Serve {
            bind,
            port,
            db_path,
        } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(port) = port {
                if port == 0 {
                    return Err(dockformer_cli::ConfigError::PortOutOfRange(port).into());
                }
                config.port = port;
            }
            if let Some(db_path) = db_path {
                config.db_path = db_path;
            }
            dockformer_cli::run_server(config).await
        }
        Commands::Validate { file } => commands::validate(&file),
        Commands::Plan { file } => commands::plan(&config, &file).await,
    }
}
