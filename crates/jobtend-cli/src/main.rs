use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jobtend_core::{PassReport, PassStatus};
use jobtend_sync::{
    build_scheduler, github_synchronizer, run_update_from_sources, shared_fetcher, SyncConfig,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "jobtend")]
#[command(about = "Curated job board synchronizer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the configured sources and append new postings to the board
    Update,
    /// Remove postings whose last-updated period has gone stale
    Archive,
    /// Run both passes on their cron schedules until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Update) {
        Commands::Update => {
            let synchronizer = github_synchronizer(config)?;
            let http = shared_fetcher(synchronizer.config())?;
            let report = run_update_from_sources(&synchronizer, http).await;
            print_report(&report)
        }
        Commands::Archive => {
            let synchronizer = github_synchronizer(config)?;
            let report = synchronizer.archive_pass().await;
            print_report(&report)
        }
        Commands::Schedule => {
            let synchronizer = Arc::new(github_synchronizer(config)?);
            let http = shared_fetcher(synchronizer.config())?;
            let mut scheduler = build_scheduler(synchronizer, http).await?;
            scheduler.start().await?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            scheduler.shutdown().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_report(report: &PassReport) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(report)?);
    if report.status == PassStatus::Error {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
