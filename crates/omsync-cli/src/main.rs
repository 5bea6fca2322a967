use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omsync_core::ReferenceKind;
use omsync_storage::TabularStore;
use omsync_sync::{build_pipeline, build_scheduler, reset_cache, JobKind, JobReport, JobSpec, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "omsync")]
#[command(about = "Syncs Omie service and sales orders into a workbook")]
struct Cli {
    /// Serve API calls from a fixture directory instead of the network.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    /// Workbook file (overrides OMSYNC_WORKBOOK).
    #[arg(long, global = true)]
    workbook: Option<PathBuf>,
    /// YAML settings file (overrides OMSYNC_SETTINGS).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the service-orders job once.
    ServiceOrders,
    /// Run the sales-orders job once.
    SalesOrders,
    /// Run both jobs on their daily schedule until interrupted.
    Schedule,
    /// Empty a reference cache down to its header.
    ResetCache { kind: ReferenceKind },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if cli.fixtures.is_some() {
        config.fixtures_dir = cli.fixtures;
    }
    if let Some(workbook) = cli.workbook {
        config.workbook_path = workbook;
    }
    if cli.settings.is_some() {
        config.settings_path = cli.settings;
    }

    match cli.command.unwrap_or(Commands::ServiceOrders) {
        Commands::ServiceOrders => run_once(&config, JobKind::ServiceOrders).await?,
        Commands::SalesOrders => run_once(&config, JobKind::SalesOrders).await?,
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline(&config).await?);
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::ResetCache { kind } => {
            let store = config.open_workbook().await?;
            let removed = reset_cache(&store, kind).await?;
            store.flush().await?;
            println!("cache reset: kind={kind} table={} removed={removed}", kind.cache_table());
        }
    }

    Ok(())
}

async fn run_once(config: &SyncConfig, kind: JobKind) -> Result<()> {
    let pipeline = build_pipeline(config).await?;
    let report = pipeline.run(&JobSpec::for_kind(kind)).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &JobReport) {
    println!(
        "{} complete: run_id={} status={:?} records={} rows={} digest={}",
        report.job,
        report.run_id,
        report.status,
        report.records_fetched,
        report.rows_written,
        report.rows_digest.as_deref().unwrap_or("-"),
    );
    for (kind, count) in &report.new_cache_entries {
        println!("  new {kind} cache entries: {count}");
    }
}
