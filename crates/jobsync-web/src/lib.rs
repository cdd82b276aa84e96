//! Axum + Askama dashboard and JSON API over a running sync pipeline.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobsync_core::{CyclePhase, CycleResult, JobFilter, JobRecord, PublishStatus, StoreStats};
use jobsync_storage::{JobStore, StorageError};
use jobsync_sync::{build_pipeline, Pipeline, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobsync-web";

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;
const RECENT_ON_DASHBOARD: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub key: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub salary: String,
    pub source_name: String,
    pub source_url: String,
    pub discovered_at: String,
    pub published_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub status: String,
}

impl From<JobRecord> for JobView {
    fn from(job: JobRecord) -> Self {
        let published_at = match job.publish_status {
            PublishStatus::Published { at } => Some(at),
            PublishStatus::Unpublished => None,
        };
        Self {
            key: job.key.to_string(),
            status: if published_at.is_some() { "published" } else { "pending" }.to_string(),
            title: job.record.title,
            company: job.record.company,
            location: job.record.location,
            salary: job.record.salary,
            source_name: job.record.source_name,
            source_url: job.record.source_url,
            discovered_at: job.discovered_at,
            published_at,
            last_error: job.last_error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovered: usize,
    pub published: usize,
    pub failed: usize,
    pub swept: usize,
    pub errors: usize,
    pub cancelled: bool,
}

impl From<&CycleResult> for CycleSummary {
    fn from(result: &CycleResult) -> Self {
        Self {
            run_id: result.run_id,
            started_at: result.started_at,
            finished_at: result.finished_at,
            discovered: result.discovered,
            published: result.published.len(),
            failed: result.failed.len(),
            swept: result.swept,
            errors: result.errors.len(),
            cancelled: result.cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub stats: StoreStats,
    pub phase: CyclePhase,
    pub last_cycle: Option<CycleSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsResponse {
    pub status: String,
    pub page: usize,
    pub per_page: usize,
    pub jobs: Vec<JobView>,
}

#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    status: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total: usize,
    published: usize,
    pending: usize,
    phase: String,
    last_run_id: String,
    last_run_finished: String,
    recent: Vec<JobView>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/run", post(run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(build_pipeline(&config).await?);
    serve(AppState::new(pipeline), config.web_port).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let pipeline = &state.pipeline;
    let stats = match pipeline.get_stats().await {
        Ok(stats) => stats,
        Err(err) => return storage_error(err),
    };
    let recent = match pipeline
        .store()
        .list_records(JobFilter::All, 1, RECENT_ON_DASHBOARD)
        .await
    {
        Ok(jobs) => jobs.into_iter().map(JobView::from).collect(),
        Err(err) => return storage_error(err),
    };
    let last = pipeline.last_cycle().await;

    render_html(IndexTemplate {
        total: stats.total,
        published: stats.published,
        pending: stats.pending,
        phase: pipeline.phase().to_string(),
        last_run_id: last
            .as_ref()
            .map(|r| r.run_id.to_string())
            .unwrap_or_else(|| "n/a".into()),
        last_run_finished: last
            .as_ref()
            .map(|r| format!("finished {}", r.finished_at.format("%Y-%m-%d %H:%M UTC")))
            .unwrap_or_default(),
        recent,
    })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.get_stats().await {
        Ok(stats) => {
            let last_cycle = state.pipeline.last_cycle().await;
            Json(StatusResponse {
                stats,
                phase: state.pipeline.phase(),
                last_cycle: last_cycle.as_ref().map(CycleSummary::from),
            })
            .into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn jobs_handler(State(state): State<Arc<AppState>>, Query(query): Query<JobsQuery>) -> Response {
    let status = query.status.unwrap_or_else(|| "all".to_string());
    let filter = JobFilter::parse(&status);
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);

    match state.pipeline.store().list_records(filter, page, per_page).await {
        Ok(jobs) => Json(JobsResponse {
            status,
            page,
            per_page,
            jobs: jobs.into_iter().map(JobView::from).collect(),
        })
        .into_response(),
        Err(err) => storage_error(err),
    }
}

/// The cycle runs on its own task so it completes even when the client
/// disconnects first.
async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    let pipeline = state.pipeline.clone();
    match tokio::spawn(async move { pipeline.run_cycle().await }).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => {
            error!(error = %err, "cycle task failed");
            server_error(err.to_string())
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

fn storage_error(err: StorageError) -> Response {
    error!(error = %err, "job store request failed");
    server_error(err.to_string())
}

fn server_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
