use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobsync_adapters::{profile_for_source, SiteProfileAdapter, SourceAdapter};
use jobsync_core::NormalizeOptions;
use jobsync_storage::{HttpClientConfig, RetryPolicy};
use serde::Deserialize;
use tracing::warn;

use crate::aggregator::AggregatorSettings;
use crate::destination::WordPressConfig;
use crate::pipeline::PipelineSettings;
use crate::publish::PublishSettings;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    /// Lower-cased region tokens a posting must mention to be kept.
    #[serde(default)]
    pub regions: Vec<String>,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Adapters for every enabled source with a known profile. Unknown ids are
    /// logged and skipped.
    pub fn build_adapters(&self, default_max_items: usize) -> Vec<Arc<dyn SourceAdapter>> {
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        for source in self.enabled_sources() {
            let Some(profile) = profile_for_source(&source.source_id) else {
                warn!(source_id = %source.source_id, "no adapter for source, skipping");
                continue;
            };
            let profile = profile
                .with_listing_urls(source.listing_urls.clone())
                .with_max_refs(source.max_items.unwrap_or(default_max_items));
            adapters.push(Arc::new(SiteProfileAdapter::new(profile)));
        }
        adapters
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub store_path: PathBuf,
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay: Duration,
    pub request_jitter: Duration,
    pub max_items_per_source: usize,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub retry: RetryPolicy,
    pub retention: Duration,
    pub max_description_len: usize,
    pub reports_enabled: bool,
    pub scheduler: SchedulerConfig,
    pub wordpress: WordPressConfig,
    pub web_port: u16,
}

/// Saturates instead of overflowing on absurd day counts.
pub fn retention_from_days(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(24 * 60 * 60))
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("JOBSYNC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let store_path = std::env::var("JOBSYNC_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| workspace_root.join("data").join("jobs.json"));
        let defaults = SchedulerConfig::default();

        Self {
            store_path,
            database_url: env_opt("DATABASE_URL"),
            user_agent: std::env::var("JOBSYNC_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (compatible; jobsync/0.1; +https://github.com/jobsync)".to_string()
            }),
            http_timeout_secs: env_or("JOBSYNC_HTTP_TIMEOUT_SECS", 30),
            request_delay: Duration::from_millis(env_or("JOBSYNC_REQUEST_DELAY_MS", 2000)),
            request_jitter: Duration::from_millis(env_or("JOBSYNC_REQUEST_JITTER_MS", 1000)),
            max_items_per_source: env_or("JOBSYNC_MAX_ITEMS_PER_SOURCE", 20),
            batch_size: env_or("JOBSYNC_BATCH_SIZE", 10),
            batch_pause: Duration::from_secs(env_or("JOBSYNC_BATCH_PAUSE_SECS", 5)),
            retry: RetryPolicy {
                max_attempts: env_or("JOBSYNC_MAX_RETRIES", 3),
                base_delay: Duration::from_millis(env_or("JOBSYNC_RETRY_BASE_MS", 2000)),
                ..RetryPolicy::default()
            },
            retention: retention_from_days(env_or("JOBSYNC_RETENTION_DAYS", 30)),
            max_description_len: env_or("JOBSYNC_MAX_DESCRIPTION_LEN", 5000),
            reports_enabled: env_flag("JOBSYNC_REPORTS_ENABLED", true),
            scheduler: SchedulerConfig {
                cycle_cron: std::env::var("JOBSYNC_SCHEDULER_CYCLE_CRON").unwrap_or(defaults.cycle_cron),
                sweep_cron: std::env::var("JOBSYNC_SCHEDULER_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            },
            wordpress: WordPressConfig {
                site_url: env_opt("WP_SITE_URL"),
                username: env_opt("WP_USERNAME").unwrap_or_default(),
                app_password: env_opt("WP_APP_PASSWORD").unwrap_or_default(),
                post_type_route: std::env::var("WP_POST_TYPE_ROUTE")
                    .unwrap_or_else(|_| "job-listings".to_string()),
                listing_ttl_days: env_or("WP_LISTING_TTL_DAYS", 30),
            },
            web_port: env_or("JOBSYNC_WEB_PORT", 3000),
            workspace_root,
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            aggregator: AggregatorSettings {
                max_items_per_source: self.max_items_per_source,
                request_delay: self.request_delay,
                request_jitter: self.request_jitter,
                normalize: NormalizeOptions {
                    max_description_len: self.max_description_len,
                },
            },
            publish: PublishSettings {
                retry: self.retry,
                batch_pause: self.batch_pause,
                publish_timeout: Duration::from_secs(self.http_timeout_secs.saturating_add(5)),
            },
            batch_size: self.batch_size,
            retention: self.retention,
            reports_dir: self.reports_enabled.then(|| self.reports_dir()),
        }
    }
}
