use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobsync_adapters::{AdapterContext, SourceAdapter};
use jobsync_core::{CyclePhase, CycleResult, StoreStats};
use jobsync_storage::{HttpFetcher, JobStore, StorageError};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{Aggregator, AggregatorSettings, RegionFilter};
use crate::destination::DestinationPublisher;
use crate::publish::{PublishDriver, PublishSettings};
use crate::reports::write_cycle_report;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub aggregator: AggregatorSettings,
    pub publish: PublishSettings,
    pub batch_size: usize,
    pub retention: Duration,
    /// Cycle reports are written here when set.
    pub reports_dir: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            aggregator: AggregatorSettings::default(),
            publish: PublishSettings::default(),
            batch_size: 10,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            reports_dir: None,
        }
    }
}

/// Owns everything one sync cycle touches. Cycles never overlap.
pub struct Pipeline {
    store: Arc<dyn JobStore>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    aggregator: Aggregator,
    publisher: PublishDriver,
    settings: PipelineSettings,
    cancel: CancellationToken,
    cycle_lock: Mutex<()>,
    phase: watch::Sender<CyclePhase>,
    last_cycle: RwLock<Option<CycleResult>>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        http: Arc<HttpFetcher>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        publisher: Arc<dyn DestinationPublisher>,
        regions: RegionFilter,
        settings: PipelineSettings,
    ) -> Self {
        let cancel = CancellationToken::new();
        let aggregator = Aggregator::new(store.clone(), http, regions, settings.aggregator.clone());
        let publisher = PublishDriver::new(store.clone(), publisher, settings.publish.clone(), cancel.clone());
        let (phase, _) = watch::channel(CyclePhase::Idle);

        Self {
            store,
            adapters,
            aggregator,
            publisher,
            settings,
            cancel,
            cycle_lock: Mutex::new(()),
            phase,
            last_cycle: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    pub async fn last_cycle(&self) -> Option<CycleResult> {
        self.last_cycle.read().await.clone()
    }

    pub async fn get_stats(&self) -> Result<StoreStats, StorageError> {
        self.store.stats().await
    }

    pub async fn sweep(&self) -> Result<usize, StorageError> {
        let removed = self.store.sweep_expired(self.settings.retention).await?;
        if removed > 0 {
            info!(removed, "expired jobs swept");
        }
        Ok(removed)
    }

    fn enter(&self, phase: CyclePhase) {
        self.phase.send_replace(phase);
    }

    /// Aggregate, publish, sweep, summarize. Every phase runs even when an
    /// earlier one failed; failures land in [`CycleResult::errors`].
    pub async fn run_cycle(&self) -> CycleResult {
        let _cycle = self.cycle_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id);
        let result = self.run_phases(run_id).instrument(span).await;
        *self.last_cycle.write().await = Some(result.clone());
        result
    }

    async fn run_phases(&self, run_id: Uuid) -> CycleResult {
        let mut result = CycleResult::empty(run_id, Utc::now());
        info!(adapters = self.adapters.len(), "cycle started");

        self.enter(CyclePhase::Aggregating);
        let ctx = AdapterContext { run_id };
        let aggregate = self
            .aggregator
            .run(&self.adapters, &ctx, &self.cancel)
            .instrument(info_span!("aggregate"))
            .await;
        result.discovered = aggregate.discovered;
        result.sources = aggregate.sources;
        for (source_id, err) in aggregate.storage_errors {
            result.record_error(CyclePhase::Aggregating, format!("{source_id}: {err}"));
        }

        self.enter(CyclePhase::Publishing);
        if self.cancel.is_cancelled() {
            info!("cancelled before publishing");
        } else {
            match self
                .publisher
                .run(self.settings.batch_size)
                .instrument(info_span!("publish"))
                .await
            {
                Ok(report) => {
                    result.published = report.published;
                    result.failed = report.failed;
                    if let Some(err) = report.storage_error {
                        error!(error = %err, "store failed while publishing");
                        result.record_error(CyclePhase::Publishing, err.to_string());
                    }
                }
                Err(err) => {
                    error!(error = %err, "could not read pending jobs");
                    result.record_error(CyclePhase::Publishing, err.to_string());
                }
            }
        }

        self.enter(CyclePhase::Sweeping);
        match self.sweep().await {
            Ok(removed) => result.swept = removed,
            Err(err) => {
                error!(error = %err, "retention sweep failed");
                result.record_error(CyclePhase::Sweeping, err.to_string());
            }
        }

        self.enter(CyclePhase::Summarizing);
        match self.store.stats().await {
            Ok(stats) => {
                info!(
                    total = stats.total,
                    published = stats.published,
                    pending = stats.pending,
                    "store stats"
                );
                result.stats = Some(stats);
            }
            Err(err) => result.record_error(CyclePhase::Summarizing, err.to_string()),
        }
        result.cancelled = self.cancel.is_cancelled();
        result.finished_at = Utc::now();

        if let Some(dir) = &self.settings.reports_dir {
            if result.has_activity() {
                match write_cycle_report(dir, &result).await {
                    Ok(path) => info!(path = %path.display(), "cycle report written"),
                    Err(err) => warn!(error = %err, "cycle report not written"),
                }
            }
        }

        info!(
            discovered = result.discovered,
            published = result.published.len(),
            failed = result.failed.len(),
            swept = result.swept,
            errors = result.errors.len(),
            "cycle finished"
        );
        self.enter(CyclePhase::Idle);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use jobsync_adapters::{AdapterError, SourceRef};
    use jobsync_core::{
        IdentityKey, JobFilter, JobRecord, NormalizedRecord, PublishOutcome, RawRecord,
    };
    use jobsync_storage::{HttpClientConfig, JsonJobStore, RetryPolicy};

    use super::*;

    struct StaticAdapter {
        id: &'static str,
        postings: Vec<RawRecord>,
    }

    #[async_trait]
    impl SourceAdapter for StaticAdapter {
        fn source_id(&self) -> &str {
            self.id
        }

        async fn list_refs(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
        ) -> Result<Vec<SourceRef>, AdapterError> {
            Ok(self
                .postings
                .iter()
                .map(|p| SourceRef {
                    url: p.source_url.clone(),
                })
                .collect())
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            source_ref: &SourceRef,
        ) -> Result<Option<RawRecord>, AdapterError> {
            Ok(self.postings.iter().find(|p| p.source_url == source_ref.url).cloned())
        }
    }

    struct BrokenAdapter;

    #[async_trait]
    impl SourceAdapter for BrokenAdapter {
        fn source_id(&self) -> &str {
            "broken"
        }

        async fn list_refs(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
        ) -> Result<Vec<SourceRef>, AdapterError> {
            Err(AdapterError::Message("listing page moved".into()))
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            _source_ref: &SourceRef,
        ) -> Result<Option<RawRecord>, AdapterError> {
            Ok(None)
        }
    }

    /// Lists every posting, optionally declares its own cap and fails to
    /// fetch one url.
    struct BulkAdapter {
        postings: Vec<RawRecord>,
        cap: Option<usize>,
        unreachable: Option<String>,
    }

    #[async_trait]
    impl SourceAdapter for BulkAdapter {
        fn source_id(&self) -> &str {
            "bulk"
        }

        fn max_refs(&self) -> Option<usize> {
            self.cap
        }

        async fn list_refs(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
        ) -> Result<Vec<SourceRef>, AdapterError> {
            Ok(self
                .postings
                .iter()
                .map(|p| SourceRef {
                    url: p.source_url.clone(),
                })
                .collect())
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            source_ref: &SourceRef,
        ) -> Result<Option<RawRecord>, AdapterError> {
            if self.unreachable.as_deref() == Some(source_ref.url.as_str()) {
                return Err(AdapterError::Message("connection reset".into()));
            }
            Ok(self.postings.iter().find(|p| p.source_url == source_ref.url).cloned())
        }
    }

    fn bulk_postings(count: usize) -> Vec<RawRecord> {
        (0..count)
            .map(|i| posting(&format!("Waiter {i}"), "Cape Town", &format!("https://bulk.example/{i}")))
            .collect()
    }

    struct ScriptedPublisher {
        outcomes: std::sync::Mutex<VecDeque<PublishOutcome>>,
        fallback: PublishOutcome,
        calls: AtomicUsize,
    }

    impl ScriptedPublisher {
        fn new(outcomes: Vec<PublishOutcome>) -> Arc<Self> {
            let fallback = outcomes.last().cloned().unwrap_or(PublishOutcome::Success);
            Arc::new(Self {
                outcomes: std::sync::Mutex::new(outcomes.into()),
                fallback,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DestinationPublisher for ScriptedPublisher {
        async fn authenticate(&self) -> bool {
            true
        }

        async fn publish(&self, _record: &NormalizedRecord) -> PublishOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.outcomes.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    /// Delegates to a JSON store but can fail the pending-set read.
    struct FlakyStore {
        inner: JsonJobStore,
        fail_pending_read: AtomicBool,
        sweeps: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn upsert_if_new(&self, record: NormalizedRecord) -> Result<bool, StorageError> {
            self.inner.upsert_if_new(record).await
        }

        async fn list_unpublished(&self) -> Result<Vec<JobRecord>, StorageError> {
            if self.fail_pending_read.load(Ordering::SeqCst) {
                return Err(StorageError::Read {
                    path: self.inner.path().to_path_buf(),
                    source: std::io::Error::other("disk unplugged"),
                });
            }
            self.inner.list_unpublished().await
        }

        async fn mark_published(&self, key: &IdentityKey) -> Result<bool, StorageError> {
            self.inner.mark_published(key).await
        }

        async fn record_failure(&self, key: &IdentityKey, error: &str) -> Result<bool, StorageError> {
            self.inner.record_failure(key, error).await
        }

        async fn sweep_expired(&self, retention: Duration) -> Result<usize, StorageError> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            self.inner.sweep_expired(retention).await
        }

        async fn stats(&self) -> Result<StoreStats, StorageError> {
            self.inner.stats().await
        }

        async fn list_records(
            &self,
            filter: JobFilter,
            page: usize,
            per_page: usize,
        ) -> Result<Vec<JobRecord>, StorageError> {
            self.inner.list_records(filter, page, per_page).await
        }
    }

    fn posting(title: &str, location: &str, url: &str) -> RawRecord {
        RawRecord {
            title: title.into(),
            company: "Acme Staffing".into(),
            location: location.into(),
            description: "Full time role.".into(),
            source_url: url.into(),
            source_name: "static".into(),
            ..Default::default()
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            aggregator: AggregatorSettings {
                request_delay: Duration::ZERO,
                request_jitter: Duration::ZERO,
                ..AggregatorSettings::default()
            },
            publish: PublishSettings {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::ZERO,
                    backoff_multiplier: 2.0,
                    max_delay: Duration::ZERO,
                },
                batch_pause: Duration::ZERO,
                publish_timeout: Duration::from_secs(5),
            },
            ..PipelineSettings::default()
        }
    }

    fn pipeline(
        store: Arc<dyn JobStore>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        publisher: Arc<dyn DestinationPublisher>,
        settings: PipelineSettings,
    ) -> Pipeline {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let regions = RegionFilter::new(["cape town", "dubai", "london"]);
        Pipeline::new(store, http, adapters, publisher, regions, settings)
    }

    async fn json_store(dir: &tempfile::TempDir) -> Arc<JsonJobStore> {
        Arc::new(JsonJobStore::open(dir.path().join("jobs.json")).await.unwrap())
    }

    #[tokio::test]
    async fn same_posting_from_two_sources_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StaticAdapter {
                id: "first",
                postings: vec![posting("Chef", "Cape Town", "https://a.example/1")],
            }),
            Arc::new(StaticAdapter {
                id: "second",
                postings: vec![posting(" chef ", "CAPE  TOWN", "https://b.example/99")],
            }),
        ];
        let publisher = ScriptedPublisher::new(vec![PublishOutcome::PermanentError("rejected".into())]);
        let pipeline = pipeline(store.clone(), adapters, publisher, settings());

        let result = pipeline.run_cycle().await;
        assert_eq!(result.discovered, 1);
        assert_eq!(result.sources.len(), 2);
        assert_eq!(result.sources.iter().map(|s| s.duplicates).sum::<usize>(), 1);
        assert_eq!(pipeline.get_stats().await.unwrap().pending, 1);
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn transient_failures_then_success_publish_in_one_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StaticAdapter {
            id: "first",
            postings: vec![posting("Nurse", "Dubai", "https://a.example/2")],
        })];
        let publisher = ScriptedPublisher::new(vec![
            PublishOutcome::TransientError("502".into()),
            PublishOutcome::TransientError("502".into()),
            PublishOutcome::Success,
        ]);
        let pipeline = pipeline(store.clone(), adapters, publisher, settings());

        let result = pipeline.run_cycle().await;
        assert_eq!(result.published.len(), 1);
        assert!(result.failed.is_empty());
        assert!(result.errors.is_empty());
        assert_eq!(store.stats().await.unwrap().published, 1);
        assert_eq!(result.stats.map(|s| s.pending), Some(0));
    }

    #[tokio::test]
    async fn permanent_failure_stays_pending_and_is_retried_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StaticAdapter {
            id: "first",
            postings: vec![posting("Site Engineer", "London", "https://a.example/3")],
        })];
        let publisher = ScriptedPublisher::new(vec![PublishOutcome::PermanentError("invalid meta".into())]);
        let pipeline = pipeline(store.clone(), adapters, publisher.clone(), settings());

        let first = pipeline.run_cycle().await;
        assert_eq!(first.failed.len(), 1);
        assert!(first.published.is_empty());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);

        let second = pipeline.run_cycle().await;
        assert_eq!(second.discovered, 0);
        assert_eq!(second.failed.len(), 1);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 2);

        let pending = store.list_unpublished().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("invalid meta"));
    }

    #[tokio::test]
    async fn publish_storage_error_still_sweeps_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore {
            inner: JsonJobStore::open(dir.path().join("jobs.json")).await.unwrap(),
            fail_pending_read: AtomicBool::new(true),
            sweeps: AtomicUsize::new(0),
        });
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(BrokenAdapter),
            Arc::new(StaticAdapter {
                id: "first",
                postings: vec![posting("Chef", "Cape Town", "https://a.example/4")],
            }),
        ];
        let pipeline = pipeline(store.clone(), adapters, ScriptedPublisher::new(vec![]), settings());

        let result = pipeline.run_cycle().await;
        assert_eq!(result.discovered, 1);
        assert_eq!(store.sweeps.load(Ordering::SeqCst), 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].phase, CyclePhase::Publishing);
        assert!(result.stats.is_some());

        let broken = result.sources.iter().find(|s| s.source_id == "broken").unwrap();
        assert_eq!(broken.list_error.as_deref(), Some("listing page moved"));
    }

    #[tokio::test]
    async fn out_of_region_and_invalid_postings_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let mut no_company = posting("Driver", "Dubai", "https://a.example/6");
        no_company.company = "  ".into();
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StaticAdapter {
            id: "first",
            postings: vec![posting("Driver", "Toronto", "https://a.example/5"), no_company],
        })];
        let pipeline = pipeline(store.clone(), adapters, ScriptedPublisher::new(vec![]), settings());

        let result = pipeline.run_cycle().await;
        assert_eq!(result.discovered, 0);
        assert_eq!(result.sources[0].out_of_region, 1);
        assert_eq!(result.sources[0].invalid, 1);
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn cancelled_pipeline_skips_work_but_still_reports() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StaticAdapter {
            id: "first",
            postings: vec![posting("Chef", "Cape Town", "https://a.example/7")],
        })];
        let pipeline = pipeline(store.clone(), adapters, ScriptedPublisher::new(vec![]), settings());
        pipeline.cancellation_token().cancel();

        let result = pipeline.run_cycle().await;
        assert!(result.cancelled);
        assert_eq!(result.discovered, 0);
        assert_eq!(pipeline.phase(), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn cycle_writes_report_and_remembers_last_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StaticAdapter {
            id: "first",
            postings: vec![posting("Chef", "Cape Town", "https://a.example/8")],
        })];
        let reports = dir.path().join("reports");
        let settings = PipelineSettings {
            reports_dir: Some(reports.clone()),
            ..settings()
        };
        let pipeline = pipeline(store, adapters, ScriptedPublisher::new(vec![]), settings);
        assert!(pipeline.last_cycle().await.is_none());

        let result = pipeline.run_cycle().await;
        assert_eq!(result.published.len(), 1);
        assert_eq!(pipeline.phase(), CyclePhase::Idle);
        assert_eq!(pipeline.last_cycle().await.map(|r| r.run_id), Some(result.run_id));
        assert!(reports
            .join(result.run_id.to_string())
            .join("cycle_summary.md")
            .exists());
    }

    #[tokio::test]
    async fn source_cap_overrides_global_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(BulkAdapter {
            postings: bulk_postings(35),
            cap: Some(30),
            unreachable: None,
        })];
        let pipeline = pipeline(store.clone(), adapters, ScriptedPublisher::new(vec![]), settings());

        let result = pipeline.run_cycle().await;
        assert_eq!(result.sources[0].refs_listed, 30);
        assert_eq!(result.discovered, 30);
        assert_eq!(store.stats().await.unwrap().total, 30);
    }

    #[tokio::test]
    async fn global_cap_applies_when_source_declares_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(BulkAdapter {
            postings: bulk_postings(30),
            cap: None,
            unreachable: None,
        })];
        let pipeline = pipeline(store, adapters, ScriptedPublisher::new(vec![]), settings());

        let result = pipeline.run_cycle().await;
        assert_eq!(result.sources[0].refs_listed, 20);
        assert_eq!(result.discovered, 20);
    }

    #[tokio::test]
    async fn failed_fetch_does_not_stop_later_items() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir).await;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(BulkAdapter {
            postings: bulk_postings(4),
            cap: None,
            unreachable: Some("https://bulk.example/1".into()),
        })];
        let pipeline = pipeline(store.clone(), adapters, ScriptedPublisher::new(vec![]), settings());

        let result = pipeline.run_cycle().await;
        let source = &result.sources[0];
        assert_eq!(source.refs_listed, 4);
        assert_eq!(source.errors, 1);
        assert_eq!(source.fetched, 3);
        assert_eq!(source.inserted, 3);
        assert!(source.list_error.is_none());
        assert!(result.errors.is_empty());

        let titles: Vec<String> = store
            .list_records(JobFilter::All, 1, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.record.title)
            .collect();
        assert!(titles.contains(&"Waiter 2".to_string()));
        assert!(titles.contains(&"Waiter 3".to_string()));
        assert!(!titles.contains(&"Waiter 1".to_string()));
    }
}
