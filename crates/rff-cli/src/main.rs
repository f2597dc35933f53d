use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use rff_sync::{build_scheduler, Reconciler, SyncConfig, SyncError};

#[derive(Debug, Parser)]
#[command(name = "rff-cli")]
#[command(about = "Rental Floorplan Feed command-line interface")]
struct Cli {
    /// Operator settings file overlaying the environment.
    #[arg(long, default_value = "settings.yaml")]
    settings: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync now.
    Sync,
    /// Serve the listing JSON API.
    Serve,
    /// Run the scheduler loop (daily sync + stale-run watchdog).
    Schedule,
    /// Print last-run stats and recent log entries.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().with_settings_file(&cli.settings)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let reconciler = Reconciler::from_config(config).await?;
            match reconciler.run().await {
                Ok(run) => println!(
                    "sync {:?}: created={} updated={} deactivated={} errors={}",
                    run.final_phase,
                    run.created_count,
                    run.updated_count,
                    run.deactivated_count,
                    run.error_count
                ),
                Err(SyncError::AlreadyRunning) => {
                    eprintln!("sync already in progress, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Serve => {
            let reconciler = Arc::new(Reconciler::from_config(config).await?);
            rff_web::serve(
                reconciler,
                std::env::var("RFF_WEB_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(8000),
            )
            .await?;
        }
        Commands::Schedule => {
            let reconciler = Arc::new(Reconciler::from_config(config).await?);
            let mut scheduler = build_scheduler(reconciler).await?;
            scheduler.start().await?;
            tokio::signal::ctrl_c().await?;
        }
        Commands::Status => {
            let reconciler = Reconciler::from_config(config).await?;
            let stats = reconciler.progress_channel().read_stats().await?;
            println!(
                "last_run={} created={} updated={} deactivated={} errors={}",
                stats
                    .last_run
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
                stats.created,
                stats.updated,
                stats.deactivated,
                stats.errors
            );
            for entry in reconciler.sync_log().read_recent(20).await {
                println!("[{}] [{:?}] {}", entry.time.to_rfc3339(), entry.level, entry.message);
            }
        }
    }

    Ok(())
}
