use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use jobsync_adapters::{AdapterContext, SourceAdapter};
use jobsync_core::{normalize, NormalizeOptions, NormalizedRecord, SourceReport};
use jobsync_storage::{HttpFetcher, JobStore, StorageError};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Keeps postings that mention one of the target regions anywhere in their
/// title, location or description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionFilter {
    tokens: Vec<String>,
}

impl RegionFilter {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// An empty token set accepts everything.
    pub fn matches(&self, record: &NormalizedRecord) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        let haystack = format!("{} {} {}", record.title, record.location, record.description).to_lowercase();
        self.tokens.iter().any(|token| haystack.contains(token.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    /// Cap for adapters that do not declare their own.
    pub max_items_per_source: usize,
    pub request_delay: Duration,
    pub request_jitter: Duration,
    pub normalize: NormalizeOptions,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            max_items_per_source: 20,
            request_delay: Duration::from_secs(2),
            request_jitter: Duration::from_secs(1),
            normalize: NormalizeOptions::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct AggregateReport {
    pub discovered: usize,
    pub sources: Vec<SourceReport>,
    /// `(source_id, error)` for adapters stopped by the store.
    pub storage_errors: Vec<(String, StorageError)>,
}

#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn JobStore>,
    http: Arc<HttpFetcher>,
    regions: RegionFilter,
    settings: AggregatorSettings,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn JobStore>,
        http: Arc<HttpFetcher>,
        regions: RegionFilter,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            store,
            http,
            regions,
            settings,
        }
    }

    /// Runs every adapter concurrently. One adapter failing never affects
    /// the others.
    pub async fn run(
        &self,
        adapters: &[Arc<dyn SourceAdapter>],
        ctx: &AdapterContext,
        cancel: &CancellationToken,
    ) -> AggregateReport {
        let runs = adapters.iter().map(|adapter| {
            let span = info_span!("aggregate_source", run_id = %ctx.run_id, source_id = adapter.source_id());
            self.run_source(adapter.as_ref(), ctx, cancel).instrument(span)
        });

        let mut report = AggregateReport::default();
        for (source, storage_error) in join_all(runs).await {
            report.discovered += source.inserted;
            if let Some(err) = storage_error {
                report.storage_errors.push((source.source_id.clone(), err));
            }
            report.sources.push(source);
        }
        report
    }

    async fn run_source(
        &self,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
        cancel: &CancellationToken,
    ) -> (SourceReport, Option<StorageError>) {
        let mut report = SourceReport::new(adapter.source_id());

        let mut refs = match adapter.list_refs(&self.http, ctx).await {
            Ok(refs) => refs,
            Err(err) => {
                warn!(error = %err, "listing failed");
                report.errors += 1;
                report.list_error = Some(err.to_string());
                return (report, None);
            }
        };
        refs.truncate(adapter.max_refs().unwrap_or(self.settings.max_items_per_source));
        report.refs_listed = refs.len();

        for (index, source_ref) in refs.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("cancelled between items");
                break;
            }
            if index > 0 && !self.politeness_pause(cancel).await {
                break;
            }

            let raw = match adapter.fetch(&self.http, ctx, source_ref).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    report.absent += 1;
                    continue;
                }
                Err(err) => {
                    warn!(url = %source_ref.url, error = %err, "fetch failed");
                    report.errors += 1;
                    continue;
                }
            };
            report.fetched += 1;

            let record = match normalize(&raw, &self.settings.normalize) {
                Ok(record) => record,
                Err(err) => {
                    debug!(url = %source_ref.url, error = %err, "record discarded");
                    report.invalid += 1;
                    continue;
                }
            };
            if !self.regions.matches(&record) {
                report.out_of_region += 1;
                continue;
            }

            match self.store.upsert_if_new(record).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.duplicates += 1,
                Err(err) => {
                    warn!(error = %err, "store rejected upsert, stopping source");
                    report.errors += 1;
                    return (report, Some(err));
                }
            }
        }

        info!(
            listed = report.refs_listed,
            inserted = report.inserted,
            duplicates = report.duplicates,
            errors = report.errors,
            "source aggregated"
        );
        (report, None)
    }

    /// `false` when cancelled while waiting.
    async fn politeness_pause(&self, cancel: &CancellationToken) -> bool {
        let jitter_ms = self.settings.request_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        let pause = self.settings.request_delay + jitter;
        if pause.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(pause) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, location: &str, description: &str) -> NormalizedRecord {
        NormalizedRecord {
            title: title.into(),
            company: "Acme".into(),
            location: location.into(),
            description: description.into(),
            salary: String::new(),
            job_type: String::new(),
            requirements: String::new(),
            benefits: String::new(),
            source_url: String::new(),
            source_name: "test".into(),
        }
    }

    #[test]
    fn region_match_is_case_insensitive_over_all_fields() {
        let filter = RegionFilter::new(["Cape Town", "dubai", "UK"]);
        assert!(filter.matches(&record("Chef", "CAPE TOWN", "")));
        assert!(filter.matches(&record("Nurse - Dubai", "Remote", "")));
        assert!(filter.matches(&record("Driver", "Anywhere", "Based in the uk office")));
        assert!(!filter.matches(&record("Driver", "Toronto", "Canada only")));
    }

    #[test]
    fn empty_region_set_keeps_everything() {
        let filter = RegionFilter::new(Vec::<String>::new());
        assert!(filter.matches(&record("Driver", "Toronto", "")));
    }
}
