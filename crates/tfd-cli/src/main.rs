use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tfd_storage::{FacilityStore, MemoryStore};
use tfd_sync::{
    dedupe_store, maybe_build_scheduler, Aggregator, ChangeDetector, IngestOptions,
    IngestPipeline, SyncConfig,
};
use tfd_web::AppState;

mod logging;

/// Exit status for any failed command; `check-update` uses 0 and 1 for its answer.
const ERROR_EXIT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "tfd")]
#[command(about = "Treatment facility directory: ingest, maintenance and read API")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the full export, then transform, dedupe, persist and recompute rollups.
    Ingest {
        /// Run every stage in memory and only print the counts.
        #[arg(long)]
        dry_run: bool,
        /// Clear facilities and rollups before loading.
        #[arg(long)]
        truncate: bool,
    },
    /// Compare the source's record count with the last ingest. Exit 0 = current, 1 = changed.
    CheckUpdate,
    /// Remove duplicate facilities already in the store, then refresh rollups.
    Dedupe,
    /// Recompute region and city rollups from stored facilities.
    Rollups,
    /// Apply database migrations.
    Migrate,
    /// Serve the read API (and the update-check scheduler when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(ERROR_EXIT)
        }
    }
}

async fn try_main() -> Result<ExitCode> {
    logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = SyncConfig::from_env();
    config.validate()?;

    match cli.command {
        Commands::Ingest { dry_run, truncate } => {
            let store = ingest_store(&config, dry_run).await?;
            let pipeline = IngestPipeline::from_config(&config, store).await?;
            let summary = pipeline
                .run(&IngestOptions { dry_run, truncate })
                .await
                .context("ingest")?;
            println!("{summary}");
        }
        Commands::CheckUpdate => {
            let store = config.open_store().await?;
            let detector = ChangeDetector::new(config.source_client()?)
                .with_threshold(config.change_threshold);
            let check = detector
                .check_for_update(store.as_ref())
                .await
                .context("check-update")?;
            println!(
                "has_update={} current_count={} latest_count={}",
                check.has_update,
                check
                    .current_count
                    .map_or_else(|| "none".to_string(), |c| c.to_string()),
                check.latest_count
            );
            return Ok(check.exit_code());
        }
        Commands::Dedupe => {
            let store = config.open_store().await?;
            let removed = dedupe_store(store.as_ref()).await.context("dedupe")?;
            let rollups = Aggregator::new(config.effective_batch_size())
                .recompute_rollups(store.as_ref())
                .await
                .context("rollups after dedupe")?;
            println!(
                "dedupe complete: removed={} regions={} sub_regions={} indexable={}",
                removed, rollups.regions, rollups.sub_regions, rollups.indexable
            );
        }
        Commands::Rollups => {
            let store = config.open_store().await?;
            let rollups = Aggregator::new(config.effective_batch_size())
                .recompute_rollups(store.as_ref())
                .await
                .context("rollups")?;
            println!(
                "rollups complete: facilities={} indexable={} regions={} sub_regions={} stale_regions={} stale_sub_regions={}",
                rollups.facilities,
                rollups.indexable,
                rollups.regions,
                rollups.sub_regions,
                rollups.stale_regions,
                rollups.stale_sub_regions
            );
        }
        Commands::Migrate => {
            let store = config.connect_store().await?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store = config.open_store().await?;
            let detector = ChangeDetector::new(config.source_client()?)
                .with_threshold(config.change_threshold);
            let scheduler = maybe_build_scheduler(&config, Arc::new(detector), store.clone()).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
            }
            tfd_web::serve(&config.bind_addr, AppState::new(store)).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// A dry run only writes to a scratch store, so it never opens the database.
async fn ingest_store(config: &SyncConfig, dry_run: bool) -> Result<Arc<dyn FacilityStore>> {
    if dry_run {
        return Ok(Arc::new(MemoryStore::new()));
    }
    config.open_store().await
}
