use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub cycle_cron: String,
    pub sweep_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cycle_cron: "0 */30 * * * *".to_string(),
            sweep_cron: "0 0 2 * * *".to_string(),
        }
    }
}

/// Registers the recurring cycle and the daily retention sweep. The caller
/// starts and shuts down the returned scheduler.
pub async fn build_scheduler(pipeline: Arc<Pipeline>, config: &SchedulerConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let cycle_pipeline = pipeline.clone();
    let cycle_job = Job::new_async(&config.cycle_cron, move |_uuid, _l| {
        let pipeline = cycle_pipeline.clone();
        Box::pin(async move {
            let result = pipeline.run_cycle().await;
            info!(
                run_id = %result.run_id,
                discovered = result.discovered,
                published = result.published.len(),
                failed = result.failed.len(),
                "scheduled cycle finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.cycle_cron))?;
    sched.add(cycle_job).await.context("adding cycle job")?;

    let sweep_pipeline = pipeline;
    let sweep_job = Job::new_async(&config.sweep_cron, move |_uuid, _l| {
        let pipeline = sweep_pipeline.clone();
        Box::pin(async move {
            match pipeline.sweep().await {
                Ok(removed) => info!(removed, "scheduled retention sweep finished"),
                Err(err) => error!(error = %err, "scheduled retention sweep failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sweep_cron))?;
    sched.add(sweep_job).await.context("adding sweep job")?;

    Ok(sched)
}
