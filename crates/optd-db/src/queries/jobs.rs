//! Database query functions for the `jobs` table.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Job, JobStatus};

/// Parameters for inserting a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub strategy_name: String,
    pub original_file_ref: String,
    pub max_attempts: i32,
}

/// Insert a new job row with status `in_progress`.
pub async fn insert_job(pool: &PgPool, new: &NewJob) -> Result<Job> {
    let job = sqlx::query_as::<_, Job>(
        "INSERT INTO jobs (owner_id, symbol, timeframe, strategy_name, original_file_ref, max_attempts) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(&new.owner_id)
    .bind(&new.symbol)
    .bind(&new.timeframe)
    .bind(&new.strategy_name)
    .bind(&new.original_file_ref)
    .bind(new.max_attempts)
    .fetch_one(pool)
    .await
    .context("failed to insert job")?;

    Ok(job)
}

/// Fetch a single job by ID.
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch job")?;

    Ok(job)
}

/// List jobs with a given aggregate status, most recently updated first.
pub async fn list_jobs_by_status(pool: &PgPool, status: JobStatus) -> Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs WHERE status = $1 ORDER BY updated_at DESC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list jobs by status")?;

    Ok(jobs)
}

/// Whether a job already exists for the given original file reference
/// (`SPEC_FULL.md` §4.10, §6.1): the Ingestor's duplicate-by-path check.
pub async fn job_exists_for_file_ref(pool: &PgPool, original_file_ref: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE original_file_ref = $1)")
            .bind(original_file_ref)
            .fetch_one(pool)
            .await
            .context("failed to check job existence by file ref")?;

    Ok(exists)
}

/// Lock a job row with `SELECT ... FOR UPDATE` inside an open transaction.
///
/// Used by the job-status recompute step so the write that follows
/// observes a consistent view of the job (`SPEC_FULL.md` §5's ordering
/// guarantee).
pub async fn lock_job_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to lock job row")?;

    Ok(job)
}

/// Write a new aggregate status for a job, within the caller's transaction.
pub async fn set_job_status(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    status: JobStatus,
) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("failed to update job status")?;

    Ok(())
}

/// Status counts across all jobs, for the `status` CLI command.
#[derive(Debug, Clone, Default)]
pub struct JobStatusCounts {
    pub in_progress: i64,
    pub completed_success: i64,
    pub completed_partial: i64,
    pub failed: i64,
}

pub async fn count_jobs_by_status(pool: &PgPool) -> Result<JobStatusCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count jobs by status")?;

    let mut counts = JobStatusCounts::default();
    for (status, count) in rows {
        match status.as_str() {
            "in_progress" => counts.in_progress = count,
            "completed_success" => counts.completed_success = count,
            "completed_partial" => counts.completed_partial = count,
            "failed" => counts.failed = count,
            _ => {}
        }
    }
    Ok(counts)
}
