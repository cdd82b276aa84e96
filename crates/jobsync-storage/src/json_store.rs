use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobsync_core::{IdentityKey, JobFilter, JobRecord, NormalizedRecord, PublishStatus, StoreStats};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{page_offset, retention_cutoff, JobStore, StorageError};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    jobs: Vec<JobRecord>,
    index: HashMap<IdentityKey, usize>,
}

impl StoreState {
    fn from_jobs(jobs: Vec<JobRecord>) -> Self {
        let mut state = StoreState::default();
        for job in jobs {
            if state.index.contains_key(&job.key) {
                continue;
            }
            state.index.insert(job.key.clone(), state.jobs.len());
            state.jobs.push(job);
        }
        state
    }

    fn get_mut(&mut self, key: &IdentityKey) -> Option<&mut JobRecord> {
        let idx = *self.index.get(key)?;
        self.jobs.get_mut(idx)
    }
}

/// Job store held in memory and persisted as one JSON snapshot file.
///
/// Mutations run under the write lock: the change is applied to a copy, the
/// copy is written to a temp file and renamed over the snapshot, and only
/// then does the in-memory state move forward. A failed write leaves both the
/// file and memory at the previous state.
#[derive(Debug)]
pub struct JsonJobStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl JsonJobStore {
    /// Opens the snapshot at `path`. A missing file is an empty store; a file
    /// that exists but cannot be read or parsed is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let jobs = match fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot =
                    serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                snapshot.jobs
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(StorageError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };

        info!(path = %path.display(), jobs = jobs.len(), "opened job store");
        Ok(Self {
            path,
            state: RwLock::new(StoreState::from_jobs(jobs)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, jobs: &[JobRecord]) -> Result<(), StorageError> {
        let write_err = |source| StorageError::Write {
            path: self.path.clone(),
            source,
        };

        let bytes = serde_json::to_vec_pretty(&Snapshot {
            version: SNAPSHOT_VERSION,
            jobs: jobs.to_vec(),
        })
        .map_err(StorageError::Encode)?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(write_err)?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jobs".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(write_err(err));
        }
        debug!(path = %self.path.display(), jobs = jobs.len(), "persisted job store snapshot");
        Ok(())
    }

    /// Applies `mutate` to a copy of the state and commits it if it reports a
    /// change and the snapshot write succeeds.
    async fn mutate<T, F>(&self, mutate: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut StoreState) -> (bool, T) + Send,
        T: Send,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let (changed, out) = mutate(&mut next);
        if changed {
            self.persist(&next.jobs).await?;
            *guard = next;
        }
        Ok(out)
    }
}

#[async_trait]
impl JobStore for JsonJobStore {
    async fn upsert_if_new(&self, record: NormalizedRecord) -> Result<bool, StorageError> {
        let job = JobRecord::discovered(record, Utc::now());
        self.mutate(move |state| {
            if state.index.contains_key(&job.key) {
                return (false, false);
            }
            state.index.insert(job.key.clone(), state.jobs.len());
            state.jobs.push(job);
            (true, true)
        })
        .await
    }

    async fn list_unpublished(&self) -> Result<Vec<JobRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .iter()
            .filter(|job| !job.is_published())
            .cloned()
            .collect())
    }

    async fn mark_published(&self, key: &IdentityKey) -> Result<bool, StorageError> {
        self.mutate(|state| match state.get_mut(key) {
            Some(job) if !job.is_published() => {
                job.publish_status = PublishStatus::Published { at: Utc::now() };
                job.last_error = None;
                (true, true)
            }
            _ => (false, false),
        })
        .await
    }

    async fn record_failure(&self, key: &IdentityKey, error: &str) -> Result<bool, StorageError> {
        self.mutate(|state| match state.get_mut(key) {
            Some(job) if !job.is_published() => {
                job.last_error = Some(error.to_string());
                (true, true)
            }
            _ => (false, false),
        })
        .await
    }

    async fn sweep_expired(&self, retention: Duration) -> Result<usize, StorageError> {
        let cutoff = retention_cutoff(retention);
        self.mutate(|state| {
            let before = state.jobs.len();
            let kept = std::mem::take(&mut state.jobs)
                .into_iter()
                .filter(|job| !job.is_expired(cutoff))
                .collect::<Vec<_>>();
            *state = StoreState::from_jobs(kept);
            let removed = before - state.jobs.len();
            (removed > 0, removed)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        let state = self.state.read().await;
        let total = state.jobs.len();
        let published = state.jobs.iter().filter(|job| job.is_published()).count();
        Ok(StoreStats {
            total,
            published,
            pending: total - published,
        })
    }

    async fn list_records(
        &self,
        filter: JobFilter,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .jobs
            .iter()
            .rev()
            .filter(|job| filter.matches(job))
            .skip(page_offset(page, per_page))
            .take(per_page.max(1))
            .cloned()
            .collect())
    }
}
