//! Auto-Reoptimizer (`SPEC_FULL.md` §4.8).
//!
//! Only runs while the Broker's main queue is empty, so it never competes
//! with fresh ingestions or retries for worker capacity. On each idle tick
//! it produces at most one derivative job candidate and hands it to the
//! Ingestor's own sidecar contract rather than inserting a Job/Task row
//! directly -- the reoptimize-source fields in the sidecar are exactly
//! what lets the Ingestor bypass its duplicate-path check (§4.10).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use optd_db::models::JobStatus;
use optd_db::queries::reoptimize_history::{self, NewReoptimizeHistory};
use optd_db::queries::{artifacts, jobs};
use optd_broker::Broker;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::ingest::{self, IngestOutcome};
use crate::notifier::Notifier;

/// Statuses considered, in priority order (§4.8).
const CANDIDATE_STATUSES: [JobStatus; 3] = [
    JobStatus::Failed,
    JobStatus::CompletedPartial,
    JobStatus::CompletedSuccess,
];

const OUTPUT_SET_ARTIFACT_KIND: &str = "output_set";

/// What one Auto-Reoptimizer tick did, mostly for logging/tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReoptimizeOutcome {
    /// The main queue wasn't empty; the Reoptimizer skipped this tick.
    Busy,
    /// No candidate job had a usable `output_set` artifact.
    NoCandidate,
    /// A derivative file was materialized and handed to the Ingestor.
    Spawned { source_job_id: uuid::Uuid, ingest: IngestOutcome },
}

#[derive(Serialize)]
struct ReoptimizeSidecar<'a> {
    user_id: &'a str,
    symbol: &'a str,
    timeframe: &'a str,
    ea_name: &'a str,
    original_filename: &'a str,
    reoptimize_source_metric_id: uuid::Uuid,
    reoptimize_source_job_id: uuid::Uuid,
}

/// Run one Auto-Reoptimizer tick.
pub async fn run_once(
    pool: &PgPool,
    broker: &Broker,
    thresholds: &optd_db::thresholds::Thresholds,
    notifier: &dyn Notifier,
    handoff_dir: &Path,
) -> Result<ReoptimizeOutcome> {
    if broker.main_queue_depth().await? != 0 {
        return Ok(ReoptimizeOutcome::Busy);
    }

    for status in CANDIDATE_STATUSES {
        let Some(candidate) = reoptimize_history::best_reoptimize_candidate_for_status(pool, status).await? else {
            continue;
        };

        let Some(artifact) = artifacts::get_artifact_for_metric(pool, candidate.metric_id, OUTPUT_SET_ARTIFACT_KIND).await? else {
            warn!(metric_id = %candidate.metric_id, "reoptimize candidate has no output_set artifact, skipping");
            continue;
        };

        let job = jobs::get_job(pool, candidate.job_id)
            .await?
            .with_context(|| format!("job {} referenced by best_metric_per_symbol view is missing", candidate.job_id))?;

        let (set_path, sidecar_path) = materialize_candidate(handoff_dir, &job, candidate.metric_id, &artifact.payload).await?;

        let outcome = ingest::ingest_file(pool, thresholds, notifier, handoff_dir, &set_path)
            .await
            .context("failed to ingest auto-reoptimize derivative")?;

        reoptimize_history::insert_reoptimize_history(
            pool,
            &NewReoptimizeHistory {
                job_id: job.id,
                metric_id: candidate.metric_id,
                trigger_kind: optd_db::models::TriggerKind::Auto,
                user_id: job.owner_id.clone(),
                job_status_snapshot: job.status,
                derivative_file_ref: set_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_owned(),
            },
        )
        .await
        .context("failed to record reoptimize history")?;

        // The sidecar is consumed by `ingest_file` on success; on rejection
        // it's left for the next scan to retry or for manual review, same
        // as any other ingestion candidate.
        let _ = &sidecar_path;

        info!(source_job_id = %job.id, metric_id = %candidate.metric_id, "auto-reoptimize candidate materialized");
        return Ok(ReoptimizeOutcome::Spawned { source_job_id: job.id, ingest: outcome });
    }

    Ok(ReoptimizeOutcome::NoCandidate)
}

async fn materialize_candidate(
    handoff_dir: &Path,
    job: &optd_db::models::Job,
    metric_id: uuid::Uuid,
    payload: &[u8],
) -> Result<(PathBuf, PathBuf)> {
    tokio::fs::create_dir_all(handoff_dir)
        .await
        .with_context(|| format!("failed to create handoff directory {}", handoff_dir.display()))?;

    let file_name = format!("reopt_{}_{}.set", job.symbol.to_lowercase(), metric_id.simple());
    let set_path = handoff_dir.join(&file_name);
    tokio::fs::write(&set_path, payload)
        .await
        .with_context(|| format!("failed to write derivative parameter file {}", set_path.display()))?;

    let sidecar = ReoptimizeSidecar {
        user_id: &job.owner_id,
        symbol: &job.symbol,
        timeframe: &job.timeframe,
        ea_name: &job.strategy_name,
        original_filename: &file_name,
        reoptimize_source_metric_id: metric_id,
        reoptimize_source_job_id: job.id,
    };
    let sidecar_path = ingest::sidecar_path_for(&set_path);
    let sidecar_json = serde_json::to_vec_pretty(&sidecar).context("failed to serialize reoptimize sidecar")?;
    tokio::fs::write(&sidecar_path, sidecar_json)
        .await
        .with_context(|| format!("failed to write sidecar {}", sidecar_path.display()))?;

    Ok((set_path, sidecar_path))
}
