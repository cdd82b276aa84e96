use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use jobsync_core::{IdentityKey, JobFilter, JobRecord, NormalizedRecord, StoreStats};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("reading job store {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing job store {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job store {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding job store snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable mapping from identity key to job record.
///
/// Aggregation only ever calls [`JobStore::upsert_if_new`]; publishing only
/// calls [`JobStore::mark_published`] and [`JobStore::record_failure`].
/// Every mutation is individually atomic.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts an unpublished record iff its key is unseen. Returns whether an
    /// insert happened. At most one caller racing on a key gets `true`.
    async fn upsert_if_new(&self, record: NormalizedRecord) -> Result<bool, StorageError>;

    /// Unpublished records in insertion order.
    async fn list_unpublished(&self) -> Result<Vec<JobRecord>, StorageError>;

    /// `false` when the key is absent or already published.
    async fn mark_published(&self, key: &IdentityKey) -> Result<bool, StorageError>;

    /// Annotates the last publish error of an unpublished record.
    async fn record_failure(&self, key: &IdentityKey, error: &str) -> Result<bool, StorageError>;

    /// Removes records discovered more than `retention` ago. Records whose
    /// timestamp does not parse are kept.
    async fn sweep_expired(&self, retention: Duration) -> Result<usize, StorageError>;

    async fn stats(&self) -> Result<StoreStats, StorageError>;

    /// Newest first. `page` is one based.
    async fn list_records(
        &self,
        filter: JobFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<JobRecord>, StorageError>;
}

pub(crate) fn retention_cutoff(retention: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| chrono::Utc::now().checked_sub_signed(retention))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}

pub(crate) fn page_offset(page: usize, per_page: usize) -> usize {
    page.max(1).saturating_sub(1).saturating_mul(per_page.max(1))
}
