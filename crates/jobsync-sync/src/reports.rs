use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobsync_core::CycleResult;
use tokio::fs;

const PUBLISHED_PREVIEW: usize = 10;

/// Writes `cycle_summary.md` and `cycle_result.json` under
/// `<reports_root>/<run_id>/` and returns that directory.
pub async fn write_cycle_report(reports_root: &Path, result: &CycleResult) -> Result<PathBuf> {
    let dir = reports_root.join(result.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    fs::write(dir.join("cycle_summary.md"), render_summary(result))
        .await
        .context("writing cycle_summary.md")?;

    let json = serde_json::to_vec_pretty(result).context("serializing cycle result")?;
    fs::write(dir.join("cycle_result.json"), json)
        .await
        .context("writing cycle_result.json")?;

    Ok(dir)
}

pub fn render_summary(result: &CycleResult) -> String {
    let mut out = format!(
        "# Job Sync Cycle\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- New jobs discovered: {}\n- Published: {}\n- Failed: {}\n- Swept: {}\n",
        result.run_id,
        result.started_at,
        result.finished_at,
        result.discovered,
        result.published.len(),
        result.failed.len(),
        result.swept,
    );
    if result.cancelled {
        out.push_str("- Cancelled before completion\n");
    }
    if let Some(stats) = &result.stats {
        let _ = writeln!(
            out,
            "- Store: {} total, {} published, {} pending",
            stats.total, stats.published, stats.pending
        );
    }

    if !result.sources.is_empty() {
        out.push_str("\n## Sources\n");
        for source in &result.sources {
            let _ = write!(
                out,
                "- {}: {} listed, {} new, {} duplicates, {} out of region, {} invalid, {} errors",
                source.source_id,
                source.refs_listed,
                source.inserted,
                source.duplicates,
                source.out_of_region,
                source.invalid,
                source.errors,
            );
            if let Some(err) = &source.list_error {
                let _ = write!(out, " (listing failed: {err})");
            }
            out.push('\n');
        }
    }

    if !result.published.is_empty() {
        out.push_str("\n## Published\n");
        for job in result.published.iter().take(PUBLISHED_PREVIEW) {
            let _ = writeln!(
                out,
                "- {} at {} ({})",
                job.record.title, job.record.company, job.record.location
            );
        }
        if result.published.len() > PUBLISHED_PREVIEW {
            let _ = writeln!(out, "- ... and {} more", result.published.len() - PUBLISHED_PREVIEW);
        }
    }

    if !result.failed.is_empty() {
        out.push_str("\n## Failed\n");
        for failed in &result.failed {
            let _ = writeln!(out, "- {}: {}", failed.job.record.title, failed.error);
        }
    }

    if !result.errors.is_empty() {
        out.push_str("\n## Errors\n");
        for err in &result.errors {
            let _ = writeln!(out, "- [{}] {}", err.phase, err.message);
        }
    }
    out
}
