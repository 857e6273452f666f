use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use findmydevice::config::Config;
use findmydevice::observability::{self, PrometheusMetrics};
use findmydevice::storage::{Storage, StorageRegistry};

/// Find-my-device storage maintenance
#[derive(Parser)]
#[command(name = "findmydevice", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema or validate an existing database
    Init,

    /// Run one garbage collection pass
    Gc,

    /// Run garbage collection periodically until interrupted
    Run,

    /// Print the JSON Schema of the config file
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Schema = cli.command {
        println!("{}", Config::json_schema());
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    observability::init_tracing(&config.observability.log_level);

    let metrics = Arc::new(PrometheusMetrics::new().context("Failed to create metrics registry")?);
    let store = StorageRegistry::with_defaults()
        .open(&config.storage, metrics.clone())
        .with_context(|| format!("Failed to open {} storage", config.storage.backend))?;

    match cli.command {
        Commands::Init => {
            println!("Database ready ({} backend)", config.storage.backend);
        }
        Commands::Gc => {
            let report = store.gc_database()?;
            println!(
                "Collected {} positions and {} nonces",
                report.positions, report.nonces
            );
        }
        Commands::Run => {
            run_gc_loop(store, Duration::from_secs(config.storage.gc_interval_secs.max(1))).await?;
            tracing::debug!(metrics = %metrics.render(), "Final metrics");
        }
        Commands::Schema => unreachable!("handled before storage is opened"),
    }
    Ok(())
}

async fn run_gc_loop(store: Arc<dyn Storage>, every: Duration) -> Result<()> {
    tracing::info!(interval_secs = every.as_secs(), "Periodic garbage collection started");
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.gc_database()).await? {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => tracing::warn!(error = %e, "Garbage collection pass failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}
