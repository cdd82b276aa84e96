use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobsync_adapters::{AdapterContext, SourceAdapter};
use jobsync_core::CycleResult;
use jobsync_storage::{HttpFetcher, JobStore, PgJobStore};
use jobsync_sync::{
    build_pipeline, build_scheduler, open_store, render_summary, retention_from_days, wordpress_publisher,
    DestinationPublisher, SourceRegistry, SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "jobsync")]
#[command(about = "Harvest job postings, dedup them and publish to WordPress")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one aggregate/publish/sweep cycle.
    Cycle {
        /// Print the full cycle result as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run a cycle now, then keep running on the configured schedule.
    Daemon,
    /// Print job store counts.
    Stats,
    /// Remove jobs older than the retention window.
    Sweep {
        #[arg(long)]
        days: Option<u64>,
    },
    /// Serve the dashboard and JSON API.
    Serve,
    /// Apply Postgres migrations.
    Migrate,
    /// Probe destination credentials and every source listing.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn,hyper=warn,reqwest=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Cycle { json: false }) {
        Commands::Cycle { json } => {
            let pipeline = build_pipeline(&config).await?;
            let result = pipeline.run_cycle().await;
            print_cycle(&result, json)?;
        }
        Commands::Daemon => run_daemon(&config).await?,
        Commands::Stats => {
            let store = open_store(&config).await?;
            let stats = store.stats().await.context("reading store stats")?;
            println!(
                "jobs: total={} published={} pending={}",
                stats.total, stats.published, stats.pending
            );
        }
        Commands::Sweep { days } => {
            let store = open_store(&config).await?;
            let retention = days.map(retention_from_days).unwrap_or(config.retention);
            let removed = store.sweep_expired(retention).await.context("sweeping store")?;
            println!("swept {removed} expired jobs");
        }
        Commands::Serve => {
            let pipeline = Arc::new(build_pipeline(&config).await?);
            jobsync_web::serve(jobsync_web::AppState::new(pipeline), config.web_port).await?;
        }
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL is not set; the JSON store needs no migrations");
            };
            let store = PgJobStore::connect(url).await.context("connecting to job database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Check => run_check(&config).await?,
    }

    Ok(())
}

fn print_cycle(result: &CycleResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result).context("serializing cycle result")?);
    } else {
        print!("{}", render_summary(result));
    }
    Ok(())
}

async fn run_daemon(config: &SyncConfig) -> Result<()> {
    let pipeline = Arc::new(build_pipeline(config).await?);
    let cancel = pipeline.cancellation_token();

    let first = pipeline.run_cycle().await;
    info!(run_id = %first.run_id, published = first.published.len(), "startup cycle finished");

    let mut sched = build_scheduler(pipeline.clone(), &config.scheduler).await?;
    sched.start().await.context("starting scheduler")?;
    info!(
        cycle = %config.scheduler.cycle_cron,
        sweep = %config.scheduler.sweep_cron,
        "scheduler running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

async fn run_check(config: &SyncConfig) -> Result<()> {
    match wordpress_publisher(config) {
        Ok(publisher) => {
            let ok = publisher.authenticate().await;
            println!("destination {}: {}", publisher.endpoint(), if ok { "ok" } else { "rejected" });
        }
        Err(err) => println!("destination: {err:#}"),
    }

    let registry = SourceRegistry::load(&config.sources_path()).await?;
    let http = HttpFetcher::new(config.http_client_config())?;
    let ctx = AdapterContext { run_id: Uuid::new_v4() };
    for adapter in registry.build_adapters(config.max_items_per_source) {
        match adapter.list_refs(&http, &ctx).await {
            Ok(refs) => println!("source {}: {} postings listed", adapter.source_id(), refs.len()),
            Err(err) => {
                warn!(source_id = adapter.source_id(), error = %err, "listing probe failed");
                println!("source {}: failed ({err})", adapter.source_id());
            }
        }
    }
    Ok(())
}
