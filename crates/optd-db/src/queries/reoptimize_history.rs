//! Database query functions for the `reoptimize_history` table and the
//! `best_metric_per_symbol` view (see `migrations/0001_init.sql`).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{JobStatus, ReoptimizeHistory, TriggerKind};

/// Parameters for inserting a new reoptimize-history row.
#[derive(Debug, Clone)]
pub struct NewReoptimizeHistory {
    pub job_id: Uuid,
    pub metric_id: Uuid,
    pub trigger_kind: TriggerKind,
    pub user_id: String,
    pub job_status_snapshot: JobStatus,
    pub derivative_file_ref: String,
}

/// Append an audit row recording that a reoptimize derivative file was
/// produced for a job (`SPEC_FULL.md` §4.8).
pub async fn insert_reoptimize_history(
    pool: &PgPool,
    new: &NewReoptimizeHistory,
) -> Result<ReoptimizeHistory> {
    let row = sqlx::query_as::<_, ReoptimizeHistory>(
        "INSERT INTO reoptimize_history \
            (job_id, metric_id, trigger_kind, user_id, job_status_snapshot, derivative_file_ref) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.job_id)
    .bind(new.metric_id)
    .bind(new.trigger_kind)
    .bind(&new.user_id)
    .bind(new.job_status_snapshot)
    .bind(&new.derivative_file_ref)
    .fetch_one(pool)
    .await
    .context("failed to insert reoptimize history row")?;

    Ok(row)
}

/// List the reoptimize-history rows for a job, most recent first.
pub async fn list_reoptimize_history_for_job(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<Vec<ReoptimizeHistory>> {
    let rows = sqlx::query_as::<_, ReoptimizeHistory>(
        "SELECT * FROM reoptimize_history WHERE job_id = $1 ORDER BY created_at DESC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list reoptimize history for job")?;

    Ok(rows)
}

/// How many auto-triggered reoptimizations a job has already produced,
/// used by the Auto-Reoptimizer's rate limiting (`SPEC_FULL.md` §4.8).
pub async fn count_auto_reoptimizations_for_job(pool: &PgPool, job_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM reoptimize_history WHERE job_id = $1 AND trigger_kind = 'auto'",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
    .context("failed to count auto reoptimizations for job")?;

    Ok(count)
}

/// A row from the `best_metric_per_symbol` view: the winning evaluation
/// for each (job, symbol) pair, as consulted by the Auto-Reoptimizer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BestMetricForSymbol {
    pub job_id: Uuid,
    pub symbol: String,
    pub job_status: String,
    pub metric_id: Uuid,
    pub task_id: Uuid,
    pub distance: f64,
    pub score: f64,
}

/// The single best reoptimize candidate among jobs with the given status
/// (`SPEC_FULL.md` §4.8): ordered by how many times the job's symbol has
/// already been auto-reoptimized (fewest first), then by metric distance
/// ascending, then score descending. Returns `None` if no job has that
/// status.
pub async fn best_reoptimize_candidate_for_status(
    pool: &PgPool,
    job_status: JobStatus,
) -> Result<Option<BestMetricForSymbol>> {
    let row = sqlx::query_as::<_, BestMetricForSymbol>(
        "SELECT b.job_id, b.symbol, b.job_status, b.metric_id, b.task_id, b.distance, b.score \
         FROM best_metric_per_symbol b \
         LEFT JOIN ( \
             SELECT j.symbol AS symbol, COUNT(*) AS reopt_count \
             FROM reoptimize_history rh \
             JOIN jobs j ON j.id = rh.job_id \
             GROUP BY j.symbol \
         ) counts ON counts.symbol = b.symbol \
         WHERE b.job_status = $1 \
         ORDER BY COALESCE(counts.reopt_count, 0) ASC, b.distance ASC, b.score DESC \
         LIMIT 1",
    )
    .bind(job_status.to_string())
    .fetch_optional(pool)
    .await
    .context("failed to fetch best reoptimize candidate")?;

    Ok(row)
}
