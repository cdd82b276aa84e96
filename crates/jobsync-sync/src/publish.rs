use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobsync_core::{FailedPublish, JobRecord, NormalizedRecord, PublishOutcome, PublishStatus};
use jobsync_storage::{JobStore, RetryPolicy, StorageError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::destination::DestinationPublisher;

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub retry: RetryPolicy,
    pub batch_pause: Duration,
    /// Upper bound on a single `publish` call; elapsing counts as transient.
    pub publish_timeout: Duration,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            batch_pause: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(35),
        }
    }
}

#[derive(Debug, Default)]
pub struct PublishReport {
    pub attempted: usize,
    pub published: Vec<JobRecord>,
    pub failed: Vec<FailedPublish>,
    /// Set when a store write failed; the loop stopped there.
    pub storage_error: Option<StorageError>,
    pub cancelled: bool,
}

pub struct PublishDriver {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn DestinationPublisher>,
    settings: PublishSettings,
    cancel: CancellationToken,
}

impl PublishDriver {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn DestinationPublisher>,
        settings: PublishSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
            cancel,
        }
    }

    /// Publishes every unpublished record, `max_batch` at a time. A record's
    /// status only advances after the destination confirmed it.
    pub async fn run(&self, max_batch: usize) -> Result<PublishReport, StorageError> {
        let pending = self.store.list_unpublished().await?;
        let mut report = PublishReport::default();
        if pending.is_empty() {
            debug!("nothing to publish");
            return Ok(report);
        }
        info!(pending = pending.len(), "publishing");

        for (batch_index, batch) in pending.chunks(max_batch.max(1)).enumerate() {
            if batch_index > 0 && !self.pause(self.settings.batch_pause).await {
                report.cancelled = true;
                break;
            }
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            for job in batch {
                report.attempted += 1;
                match self.publish_with_retry(&job.record).await {
                    Ok(outcome) => match self.store.mark_published(&job.key).await {
                        Ok(true) => {
                            debug!(key = %job.key, ?outcome, "published");
                            let mut job = job.clone();
                            job.publish_status = PublishStatus::Published { at: Utc::now() };
                            job.last_error = None;
                            report.published.push(job);
                        }
                        Ok(false) => debug!(key = %job.key, "record left the pending set before marking"),
                        Err(err) => {
                            report.storage_error = Some(err);
                            return Ok(report);
                        }
                    },
                    Err(error) => {
                        warn!(key = %job.key, title = %job.record.title, %error, "publish gave up");
                        if let Err(err) = self.store.record_failure(&job.key, &error).await {
                            report.storage_error = Some(err);
                            return Ok(report);
                        }
                        let mut job = job.clone();
                        job.last_error = Some(error.clone());
                        report.failed.push(FailedPublish { job, error });
                    }
                }
            }
        }

        info!(
            published = report.published.len(),
            failed = report.failed.len(),
            "publish pass finished"
        );
        Ok(report)
    }

    /// `Ok` with the confirming outcome, or `Err` with the last error once the
    /// attempt budget is spent or the error is permanent.
    async fn publish_with_retry(&self, record: &NormalizedRecord) -> Result<PublishOutcome, String> {
        let attempts = self.settings.retry.attempts();
        let mut attempt = 0;
        let mut reauthenticated = false;

        loop {
            let outcome = match tokio::time::timeout(self.settings.publish_timeout, self.publisher.publish(record)).await {
                Ok(outcome) => outcome,
                Err(_) => PublishOutcome::TransientError(format!(
                    "publish timed out after {}s",
                    self.settings.publish_timeout.as_secs()
                )),
            };
            attempt += 1;

            let last_error = match outcome {
                PublishOutcome::Success | PublishOutcome::AlreadyExists => return Ok(outcome),
                PublishOutcome::PermanentError(message) => return Err(message),
                PublishOutcome::TransientError(message) => message,
                PublishOutcome::AuthRejected if !reauthenticated => {
                    reauthenticated = true;
                    if attempt < attempts && self.publisher.authenticate().await {
                        info!("re-authenticated with destination, retrying");
                        continue;
                    }
                    "authentication rejected".to_string()
                }
                PublishOutcome::AuthRejected => "authentication rejected after re-authentication".to_string(),
            };

            if attempt >= attempts {
                return Err(last_error);
            }
            let delay = self.settings.retry.delay_for_attempt(attempt - 1);
            debug!(attempt, ?delay, error = %last_error, "transient publish failure, backing off");
            if !self.pause(delay).await {
                return Err(last_error);
            }
        }
    }

    /// `false` when cancelled while waiting.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
