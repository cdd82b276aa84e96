//! Sync pipeline orchestration: aggregate from sources, dedup into the job
//! store, publish to the destination, sweep, report.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobsync_storage::{HttpFetcher, JobStore, JsonJobStore, PgJobStore};
use tracing::info;

mod aggregator;
mod config;
mod destination;
mod pipeline;
mod publish;
mod reports;
mod scheduler;

pub use aggregator::{AggregateReport, Aggregator, AggregatorSettings, RegionFilter};
pub use config::{retention_from_days, SourceConfig, SourceRegistry, SyncConfig};
pub use destination::{
    build_payload, classify_response, DestinationPublisher, PublisherError, WordPressConfig,
    WordPressPublisher,
};
pub use pipeline::{Pipeline, PipelineSettings};
pub use publish::{PublishDriver, PublishReport, PublishSettings};
pub use reports::{render_summary, write_cycle_report};
pub use scheduler::{build_scheduler, SchedulerConfig};

pub const CRATE_NAME: &str = "jobsync-sync";

/// Postgres when `DATABASE_URL` is set, the JSON snapshot file otherwise.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn JobStore>> {
    if let Some(url) = &config.database_url {
        let store = PgJobStore::connect(url).await.context("connecting to job database")?;
        store.migrate().await.context("migrating job database")?;
        info!("using postgres job store");
        return Ok(Arc::new(store));
    }

    if let Some(parent) = config.store_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = JsonJobStore::open(&config.store_path)
        .await
        .with_context(|| format!("opening {}", config.store_path.display()))?;
    info!(path = %config.store_path.display(), "using json job store");
    Ok(Arc::new(store))
}

pub fn wordpress_publisher(config: &SyncConfig) -> Result<WordPressPublisher> {
    WordPressPublisher::new(
        &config.wordpress,
        Duration::from_secs(config.http_timeout_secs),
        &config.user_agent,
    )
    .context("configuring destination publisher")
}

/// Wires the store, adapters from `sources.yaml` and the WordPress publisher
/// into a ready pipeline.
pub async fn build_pipeline(config: &SyncConfig) -> Result<Pipeline> {
    let registry = SourceRegistry::load(&config.sources_path()).await?;
    let store = open_store(config).await?;
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let publisher: Arc<dyn DestinationPublisher> = Arc::new(wordpress_publisher(config)?);
    let adapters = registry.build_adapters(config.max_items_per_source);
    info!(sources = adapters.len(), regions = registry.regions.len(), "pipeline configured");

    Ok(Pipeline::new(
        store,
        http,
        adapters,
        publisher,
        RegionFilter::new(&registry.regions),
        config.pipeline_settings(),
    ))
}
