use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nrega_storage::{PgSnapshotStore, SnapshotStore};
use nrega_sync::{build_history, build_pipeline, open_store, RefreshScheduler, SyncConfig};
use nrega_web::AppState;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "nrega-cli")]
#[command(about = "MGNREGA district performance harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full refresh of the (fiscal year × month) grid.
    Sync,
    /// Serve the JSON API and run the refresh scheduler.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Print the number of stored snapshots.
    Count,
    /// Delete every stored snapshot.
    Clear,
    /// Print the reconciled timeline of a district as JSON.
    History { district: String },
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_truthy("NREGA_LOG_JSON") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::load()?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store = open_store(&config).await?;
            let summary = build_pipeline(&config, store)?.run_full_refresh().await;
            println!(
                "refresh complete: run_id={} cells={} fetched={} empty={} failed={} upserted={} rejected={}",
                summary.run_id,
                summary.cells_total,
                summary.cells_fetched,
                summary.cells_empty,
                summary.cells_failed,
                summary.records_upserted,
                summary.records_rejected
            );
        }
        Commands::Serve => serve(config).await?,
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            PgSnapshotStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Count => {
            let store = open_store(&config).await?;
            println!("{}", store.count_all().await?);
        }
        Commands::Clear => {
            let store = open_store(&config).await?;
            let removed = store.delete_all().await?;
            println!("deleted {removed} records");
        }
        Commands::History { district } => {
            let store = open_store(&config).await?;
            let periods = build_history(store.as_ref(), &district).await?;
            println!("{}", serde_json::to_string_pretty(&periods)?);
        }
    }

    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    let store = open_store(&config).await?;
    let pipeline = Arc::new(build_pipeline(&config, Arc::clone(&store))?);
    let scheduler = Arc::new(RefreshScheduler::new(
        pipeline,
        config.sync_cron.clone(),
        config.safety_net_interval,
    ));

    if config.scheduler_enabled {
        scheduler.start().await?;
    } else {
        info!("scheduler disabled; data refreshes only on demand");
    }

    tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        async move {
            if let Err(err) = scheduler.bootstrap_if_empty().await {
                error!(error = %err, "initial fetch failed");
            }
        }
    });

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => {
                error!(error = %err, "failed to listen for ctrl-c; serving until killed");
                std::future::pending::<()>().await;
            }
        }
    };
    nrega_web::serve(AppState::new(store), port, shutdown).await?;
    scheduler.stop().await
}
