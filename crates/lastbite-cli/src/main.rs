use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lastbite_jobs::{build_jobs, JobsConfig, Scheduler, SystemClock};
use lastbite_store::PgStore;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lastbite-cli")]
#[command(about = "Lastbite offer marketplace job runner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one offer-activation tick and exit.
    Tick,
    /// Run quality scoring once: all vendors, or a single one.
    Score {
        #[arg(long)]
        vendor: Option<i64>,
    },
    /// Start both scheduled jobs and park until ctrl-c.
    Run,
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

    match cli.command.unwrap_or(Commands::Tick) {
        Commands::Tick => {
            let summary = lastbite_jobs::run_tick_once_from_env().await?;
            println!(
                "tick complete: run_id={} activated={} deactivated={} sent={} suppressed={} failed={}",
                summary.run_id,
                summary.activated,
                summary.deactivated,
                summary.sent,
                summary.suppressed,
                summary.failed
            );
        }
        Commands::Score { vendor } => {
            let summary = lastbite_jobs::run_scoring_once_from_env(vendor).await?;
            println!(
                "scoring complete: run_id={} updated={} top_vendors={} errors={} duration_ms={}",
                summary.run_id, summary.updated, summary.top_vendors, summary.errors, summary.duration_ms
            );
        }
        Commands::Run => {
            let config = JobsConfig::from_env();
            if !config.scheduler_enabled {
                anyhow::bail!("scheduler disabled via SCHEDULER_ENABLED");
            }
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            let (activation, scoring) = build_jobs(&config, store, Arc::new(SystemClock))?;

            let mut scheduler = Scheduler::new().await?;
            scheduler
                .add_activation_job(&config.offer_tick_cron, activation)
                .await?;
            scheduler
                .add_scoring_job(&config.score_cron, config.schedule_tz, scoring)
                .await?;
            scheduler.start().await?;
            info!(
                offer_tick_cron = %config.offer_tick_cron,
                score_cron = %config.score_cron,
                tz = %config.schedule_tz,
                "scheduler running; ctrl-c to stop"
            );

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.stop().await?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
