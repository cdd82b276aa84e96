//! Core domain model for jobsync: records, identity keys and cycle summaries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

mod normalize;

pub use normalize::{clean_text, normalize, NormalizeOptions, ValidationError, TRUNCATION_MARKER};

pub const CRATE_NAME: &str = "jobsync-core";

/// Free-form adapter output. Nothing here is validated yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub salary: String,
    pub job_type: String,
    pub requirements: String,
    pub benefits: String,
    pub source_url: String,
    pub source_name: String,
}

/// Canonical record. Only [`normalize`] builds one from adapter output, so
/// `title`, `company` and `location` are never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    #[serde(default)]
    pub salary: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub benefits: String,
    pub source_url: String,
    #[serde(default)]
    pub source_name: String,
}

impl NormalizedRecord {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::compute(&self.title, &self.company, &self.location)
    }
}

/// Deduplication key: SHA-256 over the cleaned, lower-cased
/// title/company/location triple, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub const HEX_LEN: usize = 64;

    pub fn compute(title: &str, company: &str, location: &str) -> Self {
        let material = [title, company, location]
            .iter()
            .map(|part| clean_text(part).to_lowercase())
            .collect::<Vec<_>>()
            .join("|");
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps an already-computed key, e.g. one read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PublishStatus {
    Unpublished,
    Published { at: DateTime<Utc> },
}

impl PublishStatus {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishStatus::Published { .. })
    }
}

/// Stored entity. `discovered_at` stays textual so that a record whose
/// timestamp no longer parses can still be loaded (and is never swept).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: IdentityKey,
    pub record: NormalizedRecord,
    pub discovered_at: String,
    pub publish_status: PublishStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn discovered(record: NormalizedRecord, now: DateTime<Utc>) -> Self {
        Self {
            key: record.identity_key(),
            record,
            discovered_at: now.to_rfc3339(),
            publish_status: PublishStatus::Unpublished,
            last_error: None,
        }
    }

    pub fn discovered_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.discovered_at)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Retention check. Unparseable timestamps are never expired.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.discovered_at_utc().is_some_and(|ts| ts < cutoff)
    }

    pub fn is_published(&self) -> bool {
        self.publish_status.is_published()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub published: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFilter {
    #[default]
    All,
    Published,
    Pending,
}

impl JobFilter {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "published" | "posted" => JobFilter::Published,
            "pending" | "unpublished" => JobFilter::Pending,
            _ => JobFilter::All,
        }
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        match self {
            JobFilter::All => true,
            JobFilter::Published => job.is_published(),
            JobFilter::Pending => !job.is_published(),
        }
    }
}

/// What the destination said about one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum PublishOutcome {
    Success,
    AlreadyExists,
    AuthRejected,
    TransientError(String),
    PermanentError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPublish {
    pub job: JobRecord,
    pub error: String,
}

/// Per-adapter aggregation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub refs_listed: usize,
    pub fetched: usize,
    pub absent: usize,
    pub invalid: usize,
    pub out_of_region: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub list_error: Option<String>,
}

impl SourceReport {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Aggregating,
    Publishing,
    Sweeping,
    Summarizing,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Aggregating => "aggregating",
            CyclePhase::Publishing => "publishing",
            CyclePhase::Sweeping => "sweeping",
            CyclePhase::Summarizing => "summarizing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub phase: CyclePhase,
    pub message: String,
}

/// Summary of one orchestrator pass, handed to the notifier and UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub published: Vec<JobRecord>,
    pub failed: Vec<FailedPublish>,
    pub swept: usize,
    pub sources: Vec<SourceReport>,
    pub errors: Vec<PhaseError>,
    pub stats: Option<StoreStats>,
    pub cancelled: bool,
}

impl CycleResult {
    pub fn empty(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            discovered: 0,
            published: Vec::new(),
            failed: Vec::new(),
            swept: 0,
            sources: Vec::new(),
            errors: Vec::new(),
            stats: None,
            cancelled: false,
        }
    }

    pub fn record_error(&mut self, phase: CyclePhase, message: impl Into<String>) {
        self.errors.push(PhaseError {
            phase,
            message: message.into(),
        });
    }

    pub fn has_activity(&self) -> bool {
        self.discovered > 0
            || !self.published.is_empty()
            || !self.failed.is_empty()
            || self.swept > 0
            || !self.errors.is_empty()
    }
}
