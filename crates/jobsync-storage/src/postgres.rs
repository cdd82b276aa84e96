use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsync_core::{IdentityKey, JobFilter, JobRecord, NormalizedRecord, PublishStatus, StoreStats};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;

use crate::store::{page_offset, retention_cutoff, JobStore, StorageError};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    key: String,
    record: Json<NormalizedRecord>,
    discovered_at: String,
    published_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        JobRecord {
            key: IdentityKey::from_hex(row.key),
            record: row.record.0,
            discovered_at: row.discovered_at,
            publish_status: match row.published_at {
                Some(at) => PublishStatus::Published { at },
                None => PublishStatus::Unpublished,
            },
            last_error: row.last_error,
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT key, record, discovered_at, published_at, last_error FROM job_records";

/// Postgres-backed store. Key uniqueness and the one-way publish transition
/// are enforced by the statements themselves.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("job store migrations applied");
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert_if_new(&self, record: NormalizedRecord) -> Result<bool, StorageError> {
        let job = JobRecord::discovered(record, Utc::now());
        let result = sqlx::query(
            "INSERT INTO job_records (key, record, discovered_at) VALUES ($1, $2, $3) ON CONFLICT (key) DO NOTHING",
        )
        .bind(job.key.as_str())
        .bind(Json(&job.record))
        .bind(&job.discovered_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_unpublished(&self) -> Result<Vec<JobRecord>, StorageError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "{SELECT_COLUMNS} WHERE published_at IS NULL ORDER BY seq"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(JobRecord::from).collect())
    }

    async fn mark_published(&self, key: &IdentityKey) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE job_records SET published_at = $2, last_error = NULL WHERE key = $1 AND published_at IS NULL",
        )
        .bind(key.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(&self, key: &IdentityKey, error: &str) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE job_records SET last_error = $2 WHERE key = $1 AND published_at IS NULL",
        )
        .bind(key.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn sweep_expired(&self, retention: Duration) -> Result<usize, StorageError> {
        let cutoff = retention_cutoff(retention);
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, discovered_at FROM job_records")
            .fetch_all(&self.pool)
            .await?;

        let expired = rows
            .into_iter()
            .filter(|(_, discovered_at)| {
                DateTime::parse_from_rfc3339(discovered_at)
                    .map(|ts| ts.with_timezone(&Utc) < cutoff)
                    .unwrap_or(false)
            })
            .map(|(key, _)| key)
            .collect::<Vec<_>>();

        if expired.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM job_records WHERE key = ANY($1)")
            .bind(&expired)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        let (total, published): (i64, i64) =
            sqlx::query_as("SELECT COUNT(*), COUNT(published_at) FROM job_records")
                .fetch_one(&self.pool)
                .await?;
        let total = total.max(0) as usize;
        let published = published.max(0) as usize;
        Ok(StoreStats {
            total,
            published,
            pending: total.saturating_sub(published),
        })
    }

    async fn list_records(
        &self,
        filter: JobFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let condition = match filter {
            JobFilter::All => "",
            JobFilter::Published => "WHERE published_at IS NOT NULL",
            JobFilter::Pending => "WHERE published_at IS NULL",
        };
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "{SELECT_COLUMNS} {condition} ORDER BY seq DESC LIMIT $1 OFFSET $2"
        ))
        .bind(per_page.max(1) as i64)
        .bind(page_offset(page, per_page) as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(JobRecord::from).collect())
    }
}
