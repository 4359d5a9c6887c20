//! Watchdog (`SPEC_FULL.md` §4.7).
//!
//! Three independent passes per iteration: stuck tasks, inactive workers
//! (notify-only), and Store/Broker reconciliation. Every write here uses
//! the same transition primitives the Scheduler uses; the Watchdog never
//! calls into the Evaluator -- it only reclaims state, it does not judge
//! worker output.

use anyhow::{Context, Result};
use chrono::Utc;
use optd_broker::Broker;
use optd_db::models::{Task, TaskStatus};
use optd_db::queries::tasks::TransitionOutcome;
use optd_db::queries::{jobs, tasks};
use optd_db::thresholds::Thresholds;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::notifier::Notifier;
use crate::state::TaskStateMachine;
use crate::state::dispatch::build_envelope;

/// Tally of one Watchdog iteration, mostly for logging/tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    pub retried: usize,
    pub failed: usize,
    pub inactive_workers: usize,
    pub reconciled: usize,
}

pub async fn run_once(pool: &PgPool, broker: &Broker, thresholds: &Thresholds, notifier: &dyn Notifier) -> Result<WatchdogReport> {
    let mut report = WatchdogReport::default();

    reap_stuck_tasks(pool, broker, thresholds, notifier, &mut report).await?;
    report.inactive_workers = notify_inactive_workers(pool, thresholds, notifier).await?;
    reconcile_queue(pool, broker, &mut report).await?;

    Ok(report)
}

async fn reap_stuck_tasks(
    pool: &PgPool,
    broker: &Broker,
    thresholds: &Thresholds,
    notifier: &dyn Notifier,
    report: &mut WatchdogReport,
) -> Result<()> {
    let stale_before = Utc::now() - duration_or_zero(thresholds.job_stuck_threshold);
    let stuck = tasks::get_stuck_tasks(pool, stale_before).await?;

    for task in stuck {
        if task.status.is_terminal() {
            continue;
        }

        let attempts_remain = task.attempt_count < task.max_attempts;
        if attempts_remain && restore_blob_if_possible(broker, &task).await? {
            retry_stuck_task(pool, broker, &task).await?;
            notifier
                .notify(
                    "Task stuck, retrying",
                    &format!("task {} reclaimed by watchdog after exceeding stuck threshold", task.id),
                )
                .await;
            report.retried += 1;
        } else {
            let reason = if attempts_remain {
                "Missing input blob in Broker and Store"
            } else {
                "max attempts reached while stuck"
            };
            fail_stuck_task(pool, broker, &task, reason).await?;
            notifier
                .notify("Task failed", &format!("task {} marked failed by watchdog: {reason}", task.id))
                .await;
            report.failed += 1;
        }
    }

    Ok(())
}

/// Best-effort removal of a stuck task's envelope from the processing
/// queue, e.g. when the worker that picked it up has died. A no-op `lrem`
/// (nothing present) is not an error -- the envelope may never have made
/// it to the processing queue at all if the worker crashed before moving
/// it there.
async fn clear_stale_processing_entry(broker: &Broker, job: &optd_db::models::Job, task: &Task) -> Result<()> {
    let envelope = build_envelope(job, task);
    broker.remove_from_processing(&envelope).await
}

/// Ensure the task's input blob exists in the Broker, restoring it from
/// the Store row when possible. Returns whether the blob is (now)
/// guaranteed present.
async fn restore_blob_if_possible(broker: &Broker, task: &Task) -> Result<bool> {
    if broker.input_blob_exists(task.id).await? {
        return Ok(true);
    }
    if task.input_file_bytes.is_empty() {
        return Ok(false);
    }
    broker.set_input_blob(task.id, &task.input_file_bytes).await?;
    Ok(true)
}

async fn retry_stuck_task(pool: &PgPool, broker: &Broker, task: &Task) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to open watchdog retry transaction")?;
    let outcome = tasks::watchdog_retry(&mut tx, task.id, task.status).await?;
    if outcome != TransitionOutcome::Applied {
        // The Scheduler (or another Watchdog pass) already moved this task
        // past the snapshot `reap_stuck_tasks` read it at -- most likely
        // straight to a terminal status. Someone else already handled it.
        tx.commit().await.context("failed to commit no-op watchdog retry")?;
        info!(task_id = %task.id, ?outcome, "watchdog retry skipped: task no longer in the observed state");
        return Ok(());
    }
    TaskStateMachine::recompute_job_status_for_task(&mut tx, task.id).await?;
    tx.commit().await.context("failed to commit watchdog retry")?;

    let job = jobs::get_job(pool, task.job_id)
        .await?
        .with_context(|| format!("job {} missing while republishing stuck task", task.job_id))?;

    // The worker that was holding this task is presumed dead; clear any
    // envelope it left behind in the processing queue before pushing a
    // fresh one onto the main queue, so a late-reviving worker can't also
    // pick up the stale copy (§6.2).
    clear_stale_processing_entry(broker, &job, task).await?;
    let envelope = build_envelope(&job, task);
    broker.enqueue(&envelope).await?;

    info!(task_id = %task.id, "watchdog reclaimed stuck task");
    Ok(())
}

async fn fail_stuck_task(pool: &PgPool, broker: &Broker, task: &Task, reason: &str) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to open watchdog fail transaction")?;
    let outcome = tasks::mark_failed(&mut tx, task.id, task.status, reason).await?;
    if outcome != TransitionOutcome::Applied {
        tx.commit().await.context("failed to commit no-op watchdog failure")?;
        info!(task_id = %task.id, ?outcome, "watchdog fail skipped: task no longer in the observed state");
        return Ok(());
    }
    TaskStateMachine::recompute_job_status_for_task(&mut tx, task.id).await?;
    tx.commit().await.context("failed to commit watchdog failure")?;

    // Move whatever envelope this task left behind into the dead-letter
    // queue (§4.7, §6.2); a no-op for tasks that never had one enqueued
    // still leaves a dead-letter record of the terminally-failed task.
    if let Some(job) = jobs::get_job(pool, task.job_id).await? {
        let envelope = build_envelope(&job, task);
        broker.move_to_dead_letter(&envelope).await?;
    }
    broker.delete_input_blob(task.id).await?;
    warn!(task_id = %task.id, reason, "watchdog marked stuck task failed");
    Ok(())
}

async fn notify_inactive_workers(pool: &PgPool, thresholds: &Thresholds, notifier: &dyn Notifier) -> Result<usize> {
    let stale_before = Utc::now() - duration_or_zero(thresholds.worker_inactive_threshold);
    let workers = tasks::list_inactive_workers(pool, stale_before).await?;

    for worker in &workers {
        warn!(worker, "worker appears inactive");
        notifier
            .notify("Worker inactive", &format!("worker {worker} has not updated its assigned task recently"))
            .await;
    }

    Ok(workers.len())
}

/// Convert a `std::time::Duration` threshold to `chrono::Duration`, saturating
/// to zero on overflow rather than panicking (thresholds are always small in
/// practice, but this keeps the conversion total).
fn duration_or_zero(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

async fn reconcile_queue(pool: &PgPool, broker: &Broker, report: &mut WatchdogReport) -> Result<()> {
    let queued = tasks::list_tasks_by_status(pool, TaskStatus::Queued).await?;

    for task in queued {
        if broker.envelope_present(task.id).await? {
            continue;
        }

        if restore_blob_if_possible(broker, &task).await? {
            let job = jobs::get_job(pool, task.job_id)
                .await?
                .with_context(|| format!("job {} missing while reconciling queued task", task.job_id))?;
            let envelope = build_envelope(&job, &task);
            broker.enqueue(&envelope).await?;
            info!(task_id = %task.id, "watchdog republished missing envelope");
            report.reconciled += 1;
        } else {
            let mut tx = pool.begin().await.context("failed to open reconciliation transaction")?;
            let outcome = tasks::mark_failed(&mut tx, task.id, task.status, "Missing input blob in Broker and Store").await?;
            if outcome != TransitionOutcome::Applied {
                tx.commit().await.context("failed to commit no-op reconciliation failure")?;
                info!(task_id = %task.id, ?outcome, "watchdog reconcile-fail skipped: task no longer queued");
                continue;
            }
            TaskStateMachine::recompute_job_status_for_task(&mut tx, task.id).await?;
            tx.commit().await.context("failed to commit reconciliation failure")?;
            if let Some(job) = jobs::get_job(pool, task.job_id).await? {
                let envelope = build_envelope(&job, &task);
                broker.move_to_dead_letter(&envelope).await?;
            }
            warn!(task_id = %task.id, "watchdog failed unreconcilable queued task");
            report.failed += 1;
        }
    }

    Ok(())
}
