use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobsift_core::JobStatus;
use jobsift_storage::{JobQuery, SqliteStore};
use jobsift_sync::{build_scheduler, PipelineOrchestrator, SyncConfig};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "jobsift")]
#[command(about = "Job posting ingestion and adaptive filtering")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle now.
    Sync {
        /// Replay a recorded bundle instead of contacting providers.
        #[arg(long, value_name = "PATH", env = "JOBSIFT_FIXTURE_BUNDLE")]
        fixtures: Option<PathBuf>,
    },
    /// Run cycles on the configured cron schedule until interrupted.
    Schedule {
        /// Overrides JOBSIFT_SYNC_CRON.
        #[arg(long)]
        cron: Option<String>,
    },
    /// Undo the most recent automatic filter adjustment.
    Revert,
    /// Show this month's metered usage.
    Usage,
    /// List stored postings by status.
    Jobs {
        #[arg(long, default_value = "scored")]
        status: JobStatus,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Create or upgrade the database schema.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,jobsift=debug")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { fixtures: None }) {
        Commands::Sync { fixtures } => {
            if fixtures.is_some() {
                config.fixture_bundle = fixtures;
            }
            let pipeline = PipelineOrchestrator::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} fetched={} new={} forwarded={} excluded={} good_fits={} reports={}",
                summary.run_id,
                summary.fetched(),
                summary.inserted(),
                summary.forwarded,
                summary.excluded,
                summary.good_fits,
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.sync_cron.clone());
            let pipeline = Arc::new(PipelineOrchestrator::from_config(config).await?);
            let cancel = pipeline.cancellation();
            let mut sched = build_scheduler(pipeline, &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running, ctrl-c to stop");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            warn!("interrupt received, stopping after the current task");
            cancel.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Revert => {
            let pipeline = PipelineOrchestrator::from_config(config).await?;
            let doc = pipeline.preferences().load().await?;
            match pipeline.controller(&doc).revert_last().await? {
                Some(event) => println!(
                    "reverted adjustment #{} from {} ({})",
                    event.id, event.created_at, event.trigger_reason
                ),
                None => println!("no adjustment to revert"),
            }
        }
        Commands::Usage => {
            let pipeline = PipelineOrchestrator::from_config(config).await?;
            let usage = pipeline.metered_ledger().snapshot();
            match usage.monthly_cap {
                Some(cap) => println!(
                    "period {}: {} of {} units used, {} remaining{}",
                    usage.period,
                    usage.used_units,
                    cap,
                    usage.remaining.unwrap_or_default(),
                    if usage.exhausted { " (provider hard limit reached)" } else { "" }
                ),
                None => println!("period {}: {} units used, no cap", usage.period, usage.used_units),
            }
            for (call_type, count) in &usage.calls {
                println!("  {call_type}: {count}");
            }
        }
        Commands::Jobs { status, limit } => {
            let pipeline = PipelineOrchestrator::from_config(config).await?;
            let query = JobQuery {
                limit: Some(limit),
                ..Default::default()
            };
            let jobs = pipeline.repository().query_by_status(status, &query).await?;
            for job in &jobs {
                let fingerprint = job.fingerprint.as_str();
                println!(
                    "{}  {:<14} {} @ {} ({})",
                    fingerprint.get(..12).unwrap_or(fingerprint),
                    job.fit_category.as_str(),
                    job.title,
                    job.company_name,
                    job.location
                );
            }
            println!("{} {} postings", jobs.len(), status);
        }
        Commands::Migrate => {
            let store = SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            store.migrate().await?;
            println!("schema up to date: {}", config.database_url);
        }
    }

    Ok(())
}
