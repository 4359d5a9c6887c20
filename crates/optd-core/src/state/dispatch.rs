//! Semantic-named wrappers around [`super::TaskStateMachine`] for each
//! event that moves a task through the state graph (`SPEC_FULL.md` §4.2).
//! Naming the event at the call site (`worker_claims_task`, not
//! `transition(Queued, WorkerInProgress)`) is what the Scheduler,
//! Watchdog, and Spawner modules actually call.

use anyhow::{Context, Result};
use optd_broker::{Broker, Envelope};
use optd_db::models::{Job, Task, TaskStatus};
use optd_db::queries::tasks::{self, TransitionOutcome};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

/// Build the wire envelope for dispatching `task`, owned by `job`
/// (`SPEC_FULL.md` §6.2). Shared by the Scheduler's dispatch phase and the
/// Watchdog's reconciliation/republish path so both producers emit the
/// identical shape.
pub fn build_envelope(job: &Job, task: &Task) -> Envelope {
    Envelope::new(
        job.id,
        task.id,
        &task.input_file_path,
        &job.strategy_name,
        &job.symbol,
        &job.timeframe,
    )
}

use super::TaskStateMachine;

/// Scheduler dispatch phase: move a queueable task to `QUEUED`, bumping
/// `attempt_count` when dispatched from `RETRYING` (`SPEC_FULL.md` §4.2,
/// §4.5 step 4). Unlike the other wrappers this does not go through
/// [`TaskStateMachine::transition`] directly, since the attempt-count
/// bump is conditional on `from`; it still recomputes the Job status in
/// the same transaction for consistency with every other writer.
pub async fn dispatch_to_queue(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> Result<TransitionOutcome> {
    anyhow::ensure!(
        matches!(from, TaskStatus::New | TaskStatus::Retrying | TaskStatus::FineTuning),
        "dispatch_to_queue called with invalid source status {from}"
    );

    let mut tx = pool.begin().await.context("failed to open dispatch transaction")?;
    let outcome = tasks::dispatch_task(&mut tx, task_id, from).await?;
    if outcome == TransitionOutcome::Applied {
        TaskStateMachine::recompute_job_status_for_task(&mut tx, task_id).await?;
    }
    tx.commit().await.context("failed to commit dispatch transaction")?;
    Ok(outcome)
}

/// A worker claims a queued task (`SPEC_FULL.md` §4.2 "Worker callback").
pub async fn worker_claims_task(pool: &PgPool, task_id: Uuid, worker_id: &str) -> Result<TransitionOutcome> {
    let mut tx = pool.begin().await.context("failed to open claim transaction")?;
    let outcome = tasks::start_worker(&mut tx, task_id, worker_id).await?;
    if outcome == TransitionOutcome::Applied {
        TaskStateMachine::recompute_job_status_for_task(&mut tx, task_id).await?;
    }
    tx.commit().await.context("failed to commit claim transaction")?;
    Ok(outcome)
}

/// A worker reports successful completion of its evaluation pass
/// (`SPEC_FULL.md` §4.11).
///
/// Accepts the callback from either `WORKER_IN_PROGRESS` (the ordinary
/// path) or `QUEUED` (the claim callback never landed, or raced with
/// this one) -- workers retry at-least-once and may report completion
/// without the controller ever having observed their claim. A callback
/// against a task already in a terminal or unrelated state is logged
/// and ignored rather than treated as an error.
pub async fn worker_reports_completed(pool: &PgPool, broker: &Broker, task_id: Uuid) -> Result<TransitionOutcome> {
    worker_reports(pool, broker, task_id, TaskStatus::WorkerCompleted).await
}

/// A worker reports an unrecoverable error during its evaluation pass.
/// Same pre-state tolerance and idempotency as [`worker_reports_completed`].
pub async fn worker_reports_failed(pool: &PgPool, broker: &Broker, task_id: Uuid) -> Result<TransitionOutcome> {
    worker_reports(pool, broker, task_id, TaskStatus::WorkerFailed).await
}

async fn worker_reports(pool: &PgPool, broker: &Broker, task_id: Uuid, to: TaskStatus) -> Result<TransitionOutcome> {
    let outcome = TaskStateMachine::transition(pool, broker, task_id, TaskStatus::WorkerInProgress, to).await?;
    if outcome == TransitionOutcome::Applied {
        return Ok(outcome);
    }

    let outcome = TaskStateMachine::transition(pool, broker, task_id, TaskStatus::Queued, to).await?;
    if outcome != TransitionOutcome::Applied {
        warn!(task_id = %task_id, target = %to, "worker completion callback ignored: task not in an expected pre-state");
    }
    Ok(outcome)
}

/// Scheduler evaluation of a `WORKER_COMPLETED` task whose Evaluator
/// verdict was `SUCCESS` (`SPEC_FULL.md` §4.2).
pub async fn accept_success(pool: &PgPool, broker: &Broker, task_id: Uuid) -> Result<TransitionOutcome> {
    TaskStateMachine::transition(
        pool,
        broker,
        task_id,
        TaskStatus::WorkerCompleted,
        TaskStatus::CompletedSuccess,
    )
    .await
}

/// Scheduler evaluation of a `WORKER_COMPLETED` task whose Evaluator
/// verdict was `PARTIAL`.
pub async fn accept_partial(pool: &PgPool, broker: &Broker, task_id: Uuid) -> Result<TransitionOutcome> {
    TaskStateMachine::transition(
        pool,
        broker,
        task_id,
        TaskStatus::WorkerCompleted,
        TaskStatus::CompletedPartial,
    )
    .await
}

/// Retry a task after either a `NONE` verdict with attempts remaining,
/// or a plain `WORKER_FAILED` report with attempts remaining.
pub async fn retry(pool: &PgPool, broker: &Broker, task_id: Uuid, from: TaskStatus) -> Result<TransitionOutcome> {
    anyhow::ensure!(
        matches!(from, TaskStatus::WorkerCompleted | TaskStatus::WorkerFailed),
        "retry called with invalid source status {from}"
    );
    TaskStateMachine::transition(pool, broker, task_id, from, TaskStatus::Retrying).await
}

/// Fail a task permanently, from either post-worker outcome or the
/// Watchdog's stuck-task handling.
pub async fn fail(pool: &PgPool, broker: &Broker, task_id: Uuid, from: TaskStatus) -> Result<TransitionOutcome> {
    anyhow::ensure!(
        matches!(from, TaskStatus::WorkerCompleted | TaskStatus::WorkerFailed),
        "fail called with invalid source status {from}"
    );
    TaskStateMachine::transition(pool, broker, task_id, from, TaskStatus::Failed).await
}
