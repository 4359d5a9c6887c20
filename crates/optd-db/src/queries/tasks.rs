//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{StepName, Task, TaskStatus};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub job_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub step_name: StepName,
    pub step_number: i32,
    pub max_attempts: i32,
    pub fine_tune_depth: i32,
    pub priority: f64,
    pub input_file_path: String,
    pub input_file_bytes: Vec<u8>,
    pub best_prior_metric_id: Option<Uuid>,
}

/// Insert a new task row with status `new`.
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
            (job_id, parent_task_id, step_name, step_number, max_attempts, \
             fine_tune_depth, priority, input_file_path, input_file_bytes, best_prior_metric_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(new.job_id)
    .bind(new.parent_task_id)
    .bind(new.step_name)
    .bind(new.step_number)
    .bind(new.max_attempts)
    .bind(new.fine_tune_depth)
    .bind(new.priority)
    .bind(&new.input_file_path)
    .bind(&new.input_file_bytes)
    .bind(new.best_prior_metric_id)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Insert a fine-tune child task row with status `fine_tuning`, per the
/// Fine-Tune Spawner's transition `∅ -> FINE_TUNING` (`SPEC_FULL.md`
/// §4.2); distinct from [`insert_task`], which the Ingestor uses for
/// fresh `optimize` tasks.
pub async fn insert_fine_tune_child(pool: &PgPool, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
            (job_id, parent_task_id, step_name, step_number, status, max_attempts, \
             fine_tune_depth, priority, input_file_path, input_file_bytes, best_prior_metric_id) \
         VALUES ($1, $2, $3, $4, 'fine_tuning', $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(new.job_id)
    .bind(new.parent_task_id)
    .bind(new.step_name)
    .bind(new.step_number)
    .bind(new.max_attempts)
    .bind(new.fine_tune_depth)
    .bind(new.priority)
    .bind(&new.input_file_path)
    .bind(&new.input_file_bytes)
    .bind(new.best_prior_metric_id)
    .fetch_one(pool)
    .await
    .context("failed to insert fine-tune child task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List every task belonging to a job, oldest first.
pub async fn list_tasks_for_job(pool: &PgPool, job_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE job_id = $1 ORDER BY created_at ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for job")?;

    Ok(tasks)
}

/// Statuses of every task belonging to a job, read inside the caller's
/// transaction so a job-status recompute sees a consistent snapshot
/// (`SPEC_FULL.md` §4.1, §5).
pub async fn list_task_statuses_for_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
) -> Result<Vec<TaskStatus>> {
    let statuses: Vec<(TaskStatus,)> =
        sqlx::query_as("SELECT status FROM tasks WHERE job_id = $1")
            .bind(job_id)
            .fetch_all(&mut **tx)
            .await
            .context("failed to list task statuses for job")?;

    Ok(statuses.into_iter().map(|(s,)| s).collect())
}

/// Lock a task row with `SELECT ... FOR UPDATE` inside an open transaction.
pub async fn lock_task_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to lock task row")?;

    Ok(task)
}

/// Result of an optimistic-lock transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The row moved from `from` to `to`.
    Applied,
    /// The row exists, but its status no longer matched `from`.
    StatusMismatch,
    /// No row exists with that ID.
    NotFound,
}

/// Move a task from `from` to `to`, guarded by an optimistic-lock `WHERE
/// status = $from` clause (see `SPEC_FULL.md` §4.2). Does not touch
/// `attempt_count`; dispatch transitions use [`dispatch_task`] instead.
pub async fn transition_task_status(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<TransitionOutcome> {
    let rows = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = now() WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(&mut **tx)
    .await
    .context("failed to transition task status")?
    .rows_affected();

    if rows == 1 {
        return Ok(TransitionOutcome::Applied);
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
        .bind(id)
        .fetch_one(&mut **tx)
        .await
        .context("failed to check task existence")?;

    Ok(if exists {
        TransitionOutcome::StatusMismatch
    } else {
        TransitionOutcome::NotFound
    })
}

/// Dispatch a task (`NEW`/`RETRYING`/`FINE_TUNING` -> `QUEUED`). Bumps
/// `attempt_count` only when `from` is `RETRYING` (`SPEC_FULL.md` §4.2,
/// §4.5 step 4); this is the only place `attempt_count` increments (§9
/// Open Question resolution). `assigned_worker` is not known yet at this
/// point -- a worker claims the row later via [`start_worker`].
pub async fn dispatch_task(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    from: TaskStatus,
) -> Result<TransitionOutcome> {
    let bump = from == TaskStatus::Retrying;
    let rows = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', \
             attempt_count = attempt_count + CASE WHEN $1 THEN 1 ELSE 0 END, \
             updated_at = now() \
         WHERE id = $2 AND status = $3",
    )
    .bind(bump)
    .bind(id)
    .bind(from)
    .execute(&mut **tx)
    .await
    .context("failed to dispatch task")?
    .rows_affected();

    if rows == 1 {
        return Ok(TransitionOutcome::Applied);
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
        .bind(id)
        .fetch_one(&mut **tx)
        .await
        .context("failed to check task existence")?;

    Ok(if exists {
        TransitionOutcome::StatusMismatch
    } else {
        TransitionOutcome::NotFound
    })
}

/// A worker claims a queued task, recording its identity and moving the
/// task to `WORKER_IN_PROGRESS` (`SPEC_FULL.md` §4.2 "Worker callback").
pub async fn start_worker(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    worker_id: &str,
) -> Result<TransitionOutcome> {
    let rows = sqlx::query(
        "UPDATE tasks \
         SET status = 'worker_in_progress', assigned_worker = $1, \
             last_heartbeat = now(), updated_at = now() \
         WHERE id = $2 AND status = 'queued'",
    )
    .bind(worker_id)
    .bind(id)
    .execute(&mut **tx)
    .await
    .context("failed to record worker claim")?
    .rows_affected();

    if rows == 1 {
        return Ok(TransitionOutcome::Applied);
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
        .bind(id)
        .fetch_one(&mut **tx)
        .await
        .context("failed to check task existence")?;

    Ok(if exists {
        TransitionOutcome::StatusMismatch
    } else {
        TransitionOutcome::NotFound
    })
}

/// Record a worker heartbeat and/or error string without changing status.
pub async fn record_heartbeat(pool: &PgPool, id: Uuid, last_error: Option<&str>) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET last_heartbeat = now(), last_error = COALESCE($1, last_error), \
         updated_at = now() WHERE id = $2",
    )
    .bind(last_error)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record task heartbeat")?;

    Ok(())
}

/// Reset a task back to `RETRYING`, clearing its worker assignment. Used by
/// the Watchdog for stuck in-progress tasks that still have attempts left.
///
/// Guarded by the same optimistic-lock `WHERE status = $from` predicate as
/// [`transition_task_status`]/[`dispatch_task`]/[`start_worker`]: the
/// Watchdog acts on a snapshot (`get_stuck_tasks`) that can go stale by the
/// time this runs, e.g. the Scheduler may have already moved the task to a
/// terminal status. Without the guard that write would silently resurrect
/// a terminal task back to `RETRYING`, violating `SPEC_FULL.md` §3's
/// "terminal statuses are immutable" invariant.
pub async fn watchdog_retry(tx: &mut Transaction<'_, Postgres>, id: Uuid, from: TaskStatus) -> Result<TransitionOutcome> {
    let rows = sqlx::query(
        "UPDATE tasks SET status = 'retrying', assigned_worker = NULL, \
         last_error = COALESCE(last_error, 'watchdog: stuck task reclaimed'), updated_at = now() \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from)
    .execute(&mut **tx)
    .await
    .context("failed to reset stuck task to retrying")?
    .rows_affected();

    if rows == 1 {
        return Ok(TransitionOutcome::Applied);
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
        .bind(id)
        .fetch_one(&mut **tx)
        .await
        .context("failed to check task existence")?;

    Ok(if exists {
        TransitionOutcome::StatusMismatch
    } else {
        TransitionOutcome::NotFound
    })
}

/// Mark a task permanently `FAILED`. Used by the Watchdog once retries are
/// exhausted, and by the Evaluator when a task's last attempt is spent.
///
/// Same optimistic-lock guard as [`watchdog_retry`], for the same reason:
/// callers act on a snapshot that may already have moved on.
pub async fn mark_failed(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    from: TaskStatus,
    reason: &str,
) -> Result<TransitionOutcome> {
    let rows = sqlx::query(
        "UPDATE tasks SET status = 'failed', last_error = $1, updated_at = now() \
         WHERE id = $2 AND status = $3",
    )
    .bind(reason)
    .bind(id)
    .bind(from)
    .execute(&mut **tx)
    .await
    .context("failed to mark task failed")?
    .rows_affected();

    if rows == 1 {
        return Ok(TransitionOutcome::Applied);
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
        .bind(id)
        .fetch_one(&mut **tx)
        .await
        .context("failed to check task existence")?;

    Ok(if exists {
        TransitionOutcome::StatusMismatch
    } else {
        TransitionOutcome::NotFound
    })
}

/// All tasks in a single status, for callers that don't need priority
/// ordering (the Watchdog's reconciliation pass, `SPEC_FULL.md` §4.7 step 3).
pub async fn list_tasks_by_status(pool: &PgPool, status: TaskStatus) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = $1 ORDER BY updated_at ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by status")?;

    Ok(tasks)
}

/// Distinct worker ids assigned to `WORKER_IN_PROGRESS` tasks whose
/// `updated_at` is older than `stale_before`, for the Watchdog's inactive-
/// worker check (`SPEC_FULL.md` §4.7 step 2).
pub async fn list_inactive_workers(pool: &PgPool, stale_before: DateTime<Utc>) -> Result<Vec<String>> {
    let workers: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT assigned_worker FROM tasks \
         WHERE status = 'worker_in_progress' \
           AND assigned_worker IS NOT NULL \
           AND updated_at < $1",
    )
    .bind(stale_before)
    .fetch_all(pool)
    .await
    .context("failed to list inactive workers")?;

    Ok(workers.into_iter().map(|(w,)| w).collect())
}

/// Tasks in `NEW`, `RETRYING`, or `FINE_TUNING`, ordered by priority
/// descending, for the Scheduler's dispatch phase (`SPEC_FULL.md` §4.5 step
/// 4). Excludes tasks whose job already reached `COMPLETED_SUCCESS` --
/// success freezes the job, so nothing more of it is ever dispatched (§8 P5).
pub async fn get_queueable_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         JOIN jobs j ON j.id = t.job_id \
         WHERE t.status IN ('new', 'retrying', 'fine_tuning') \
           AND j.status <> 'completed_success' \
         ORDER BY t.priority DESC, t.created_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list queueable tasks")?;

    Ok(tasks)
}

/// Tasks in `WORKER_COMPLETED` or `WORKER_FAILED`, for the Scheduler's
/// evaluation phase (`SPEC_FULL.md` §4.5 step 2).
///
/// Excludes tasks whose Job already has a `COMPLETED_SUCCESS` sibling
/// (§4.2's post-worker guard, §8 P5 "success freezes the job"): such a
/// task is simply left as-is, untouched by this or any later iteration.
pub async fn get_post_worker_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         JOIN jobs j ON j.id = t.job_id \
         WHERE t.status IN ('worker_completed', 'worker_failed') \
           AND j.status <> 'completed_success' \
         ORDER BY t.updated_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list post-worker tasks")?;

    Ok(tasks)
}

/// Non-terminal, in-progress-class tasks whose `updated_at` is older than
/// `stale_before`, for the Watchdog (`SPEC_FULL.md` §4.7).
pub async fn get_stuck_tasks(pool: &PgPool, stale_before: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('new', 'queued', 'worker_in_progress', 'retrying', 'fine_tuning') \
           AND updated_at < $1 \
         ORDER BY updated_at ASC",
    )
    .bind(stale_before)
    .fetch_all(pool)
    .await
    .context("failed to list stuck tasks")?;

    Ok(tasks)
}

/// `COMPLETED_PARTIAL` tasks that have no fine-tune child yet, candidates
/// for the Fine-Tune Spawner (`SPEC_FULL.md` §4.6).
///
/// No `step_name` restriction: §4.6 spawns "for every task in
/// `COMPLETED_PARTIAL`", gated only by `fine_tune_depth`, so a `fine_tune`
/// task that itself lands `COMPLETED_PARTIAL` is as eligible a parent as an
/// `optimize` one -- otherwise a lineage would silently cap at depth 1
/// regardless of `max_fine_tune_depth`.
pub async fn get_partial_tasks_without_fine_tune_child(
    pool: &PgPool,
    max_fine_tune_depth: i32,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.status = 'completed_partial' \
           AND t.fine_tune_depth < $1 \
           AND NOT EXISTS ( \
               SELECT 1 FROM tasks c \
               WHERE c.parent_task_id = t.id AND c.step_name = 'fine_tune' \
           ) \
         ORDER BY t.updated_at ASC",
    )
    .bind(max_fine_tune_depth)
    .fetch_all(pool)
    .await
    .context("failed to list fine-tune spawn candidates")?;

    Ok(tasks)
}

/// Per-status task counts for a single job, used by the Job Status
/// Aggregator and the `status` CLI command.
#[derive(Debug, Clone, Default)]
pub struct TaskStatusCounts {
    pub new: i64,
    pub queued: i64,
    pub worker_in_progress: i64,
    pub worker_completed: i64,
    pub worker_failed: i64,
    pub retrying: i64,
    pub fine_tuning: i64,
    pub completed_success: i64,
    pub completed_partial: i64,
    pub failed: i64,
}

pub async fn count_tasks_by_status_for_job(
    pool: &PgPool,
    job_id: Uuid,
) -> Result<TaskStatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) FROM tasks WHERE job_id = $1 GROUP BY status",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("failed to count tasks by status for job")?;

    let mut counts = TaskStatusCounts::default();
    for (status, count) in rows {
        match status.as_str() {
            "new" => counts.new = count,
            "queued" => counts.queued = count,
            "worker_in_progress" => counts.worker_in_progress = count,
            "worker_completed" => counts.worker_completed = count,
            "worker_failed" => counts.worker_failed = count,
            "retrying" => counts.retrying = count,
            "fine_tuning" => counts.fine_tuning = count,
            "completed_success" => counts.completed_success = count,
            "completed_partial" => counts.completed_partial = count,
            "failed" => counts.failed = count,
            _ => {}
        }
    }
    Ok(counts)
}
