use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tagsync_adapters::{DirectoryClient, SnapshotDirectory};
use tagsync_sync::{http_directory, open_store, SyncConfig, SyncServices};
use tagsync_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tagsync")]
#[command(about = "Keeps the local RFID access cache in step with the member directory")]
struct Cli {
    /// YAML config file (falls back to TAGSYNC_CONFIG, then ./tagsync.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync pass and print its summary as JSON
    Sync {
        /// Read contacts from a JSON export instead of the live directory
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Create or upgrade the cache database schema
    Migrate,
    /// Serve webhooks and cache reads, with scheduled full passes
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = SyncConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Sync { snapshot } => {
            let directory: Arc<dyn DirectoryClient> = match snapshot {
                Some(path) => Arc::new(SnapshotDirectory::from_json_file(&path)?),
                None => http_directory(&config)?,
            };
            let services = SyncServices::connect(&config, directory).await?;
            let summary = services.orchestrator.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            open_store(&config).await?;
            info!(database_url = %config.database_url, "schema up to date");
        }
        Commands::Serve => serve(&config).await?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: &SyncConfig) -> Result<()> {
    let webhook_token = config.webhook_token()?.clone();
    let services = SyncServices::connect(config, http_directory(config)?).await?;

    let mut scheduler = services.orchestrator.start(&config.sync).await?;
    let mut state = AppState::from_services(&services, webhook_token).with_config(config.clone());
    match &config.admin_token {
        Some(token) => state = state.with_admin_token(token.clone()),
        None => warn!("ADMIN_TOKEN not set; admin routes are locked"),
    }
    let served = tagsync_web::serve(&config.web.bind_addr, state, tagsync_web::shutdown_signal()).await;

    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler did not shut down cleanly");
        }
    }
    services.store.pool().close().await;
    served.context("http server exited with an error")
}
