// taskgate - Main Entry Point
//
// Manages:
// - CLI interface
// - HTTP submission server with an in-process drain loop
// - Standalone drain worker sharing a SQLite store
// - One-off submissions and queue inspection

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use taskgate::config::{Config, StoreBackend};
use taskgate::identity::Identity;
use taskgate::logging::LogSettings;
use taskgate::metrics;
use taskgate::runtime::Runtime;
use taskgate::server::{self, AppState, SubmitResponse};
use tracing::{info, warn};

/// taskgate: per-user rate-limited task admission
#[derive(Parser, Debug)]
#[command(name = "taskgate")]
#[command(version)]
#[command(about = "Per-user rate-limited task admission with a delayed retry queue", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/taskgate/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server (and the drain loop unless drain.enabled = false)
    Serve {
        /// Override server.port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run only the drain loop against the configured store
    Worker,
    /// Submit one task and print the outcome
    Submit {
        /// Submitter identity
        user_id: String,
    },
    /// Print queue statistics and dead letters
    Status,
    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {:?}", path);
            }
            Config::load_from_path(path)
        }
        None => Config::load(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;

    LogSettings::from_config(&config, args.verbose)?
        .init()
        .context("Failed to initialize logging")?;

    match args.command {
        Commands::Serve { port } => serve(config, port).await,
        Commands::Worker => worker(config).await,
        Commands::Submit { user_id } => submit(config, user_id).await,
        Commands::Status => status(config).await,
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    metrics::init().context("Failed to initialize metrics")?;

    let addr = config.server.addr()?;
    let runtime = Runtime::from_config(config)?;
    info!("taskgate v{} starting", env!("CARGO_PKG_VERSION"));

    let drain = if runtime.config.drain.enabled {
        Some(runtime.drain_loop().spawn())
    } else {
        info!("In-process drain loop disabled; run `taskgate worker` against the same store");
        None
    };

    let app = server::router(AppState::from(&runtime));
    let result = server::serve(app, addr, shutdown_signal()).await;

    if let Some(drain) = drain {
        drain.shutdown().await;
    }
    result
}

async fn worker(config: Config) -> Result<()> {
    if config.store_backend()? == StoreBackend::Memory {
        warn!("Worker is using the memory backend and will only see tasks it queues itself");
    }
    metrics::init().context("Failed to initialize metrics")?;

    let runtime = Runtime::from_config(config)?;
    let drain = runtime.drain_loop().spawn();

    shutdown_signal().await;
    drain.shutdown().await;
    Ok(())
}

async fn submit(config: Config, user_id: String) -> Result<()> {
    let identity = Identity::new(user_id)?;
    let runtime = Runtime::from_config(config)?;

    let outcome = runtime.scheduler.submit(identity).await?;
    println!("{}", serde_json::to_string_pretty(&SubmitResponse::from(outcome))?);
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let runtime = Runtime::from_config(config)?;

    let stats = runtime.queue.stats().await?;
    let dead_letters = runtime.queue.dead_letters().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "queue": stats,
            "dead_letters": dead_letters,
        }))?
    );
    Ok(())
}
