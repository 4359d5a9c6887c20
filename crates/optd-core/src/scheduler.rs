//! Scheduler (`SPEC_FULL.md` §4.5).
//!
//! One iteration runs three phases in order -- post-worker evaluation,
//! fine-tune spawning, dispatch -- so that a task accepted as
//! `COMPLETED_PARTIAL` this tick can have its fine-tune child spawned and
//! that child dispatched in the very same tick. Threshold reload and the
//! inter-iteration sleep are the caller's concern (`optd_db::thresholds`'s
//! own doc comment on why Thresholds lives behind an `ArcSwap`), so this
//! module only exposes a single iteration.

use anyhow::{Context, Result};
use optd_broker::Broker;
use optd_db::models::{StepName, Task, TaskStatus};
use optd_db::queries::{metrics, tasks};
use optd_db::thresholds::Thresholds;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::evaluator::{self, Verdict};
use crate::notifier::Notifier;
use crate::priority;
use crate::spawner;
use crate::state::dispatch;

/// Candidate pool fetched before application-level filtering and
/// re-ranking in the dispatch phase. Generous relative to `BATCH_SIZE` so
/// the priority re-sort has enough to work with even when retries
/// dominate the front of the DB's own `priority DESC` ordering.
const DISPATCH_FETCH_LIMIT: i64 = 500;

/// Tally of one Scheduler iteration, mostly for logging/tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub accepted_success: usize,
    pub accepted_partial: usize,
    pub retried: usize,
    pub failed: usize,
    pub fine_tune_spawned: usize,
    pub dispatched: usize,
}

/// Run one Scheduler iteration: post-worker phase, fine-tune phase,
/// dispatch phase (`SPEC_FULL.md` §4.5 steps 2-4).
pub async fn run_once(
    pool: &PgPool,
    broker: &Broker,
    thresholds: &Thresholds,
    notifier: &dyn Notifier,
) -> Result<SchedulerReport> {
    let mut report = SchedulerReport::default();

    post_worker_phase(pool, broker, thresholds, notifier, &mut report).await?;
    report.fine_tune_spawned = spawner::run_once(pool, thresholds).await?;
    dispatch_phase(pool, broker, thresholds, &mut report).await?;

    Ok(report)
}

async fn post_worker_phase(
    pool: &PgPool,
    broker: &Broker,
    thresholds: &Thresholds,
    notifier: &dyn Notifier,
    report: &mut SchedulerReport,
) -> Result<()> {
    for task in tasks::get_post_worker_tasks(pool).await? {
        match task.status {
            TaskStatus::WorkerCompleted => evaluate_worker_completed(pool, broker, notifier, &task, thresholds, report).await?,
            TaskStatus::WorkerFailed => resolve_worker_failed(pool, broker, notifier, &task, report).await?,
            other => warn!(task_id = %task.id, status = %other, "post-worker phase fetched task in unexpected status"),
        }
    }
    Ok(())
}

async fn evaluate_worker_completed(
    pool: &PgPool,
    broker: &Broker,
    notifier: &dyn Notifier,
    task: &Task,
    thresholds: &Thresholds,
    report: &mut SchedulerReport,
) -> Result<()> {
    let task_metrics = metrics::list_metrics_for_task(pool, task.id).await?;
    let verdict = evaluator::evaluate(&task_metrics, thresholds.distance_threshold, thresholds.score_threshold);

    match verdict {
        Verdict::Success => {
            dispatch::accept_success(pool, broker, task.id).await?;
            info!(task_id = %task.id, "evaluator accepted task as success");
            report.accepted_success += 1;
        }
        Verdict::Partial => {
            dispatch::accept_partial(pool, broker, task.id).await?;
            info!(task_id = %task.id, "evaluator accepted task as partial");
            report.accepted_partial += 1;
        }
        Verdict::None if task.attempt_count < task.max_attempts => {
            dispatch::retry(pool, broker, task.id, TaskStatus::WorkerCompleted).await?;
            notifier
                .notify("Task retrying", &format!("task {} retrying after an unsuccessful evaluation", task.id))
                .await;
            report.retried += 1;
        }
        Verdict::None => {
            dispatch::fail(pool, broker, task.id, TaskStatus::WorkerCompleted).await?;
            notifier
                .notify("Task failed", &format!("task {} failed: max attempts reached after worker_completed", task.id))
                .await;
            report.failed += 1;
        }
    }
    Ok(())
}

async fn resolve_worker_failed(
    pool: &PgPool,
    broker: &Broker,
    notifier: &dyn Notifier,
    task: &Task,
    report: &mut SchedulerReport,
) -> Result<()> {
    if task.attempt_count < task.max_attempts {
        dispatch::retry(pool, broker, task.id, TaskStatus::WorkerFailed).await?;
        notifier
            .notify("Task retrying", &format!("task {} retrying after a worker failure report", task.id))
            .await;
        report.retried += 1;
    } else {
        dispatch::fail(pool, broker, task.id, TaskStatus::WorkerFailed).await?;
        notifier
            .notify("Task failed", &format!("task {} failed: max attempts reached after worker_failed", task.id))
            .await;
        report.failed += 1;
    }
    Ok(())
}

async fn dispatch_phase(pool: &PgPool, broker: &Broker, thresholds: &Thresholds, report: &mut SchedulerReport) -> Result<()> {
    let candidates = tasks::get_queueable_tasks(pool, DISPATCH_FETCH_LIMIT).await?;

    let mut new_tasks = Vec::new();
    let mut other_tasks = Vec::new();
    for task in candidates {
        if task.attempt_count >= task.max_attempts || task.fine_tune_depth > thresholds.max_fine_tune_depth {
            continue;
        }
        if task.status == TaskStatus::New {
            new_tasks.push(task);
        } else {
            other_tasks.push(task);
        }
    }

    let now = chrono::Utc::now();
    let mut new_scored = score_all(pool, &new_tasks, now, thresholds).await?;
    let mut other_scored = score_all(pool, &other_tasks, now, thresholds).await?;
    new_scored.sort_by(|a, b| priority::cmp_for_dispatch((&a.0, a.1), (&b.0, b.1)));
    other_scored.sort_by(|a, b| priority::cmp_for_dispatch((&a.0, a.1), (&b.0, b.1)));

    let mut batch: Vec<Task> = Vec::with_capacity(thresholds.batch_size);
    batch.extend(new_scored.into_iter().take(thresholds.min_new).map(|(t, _)| t));
    let remaining = thresholds.batch_size.saturating_sub(batch.len());
    batch.extend(other_scored.into_iter().take(remaining).map(|(t, _)| t));

    for task in batch {
        let job = optd_db::queries::jobs::get_job(pool, task.job_id)
            .await?
            .with_context(|| format!("job {} missing while dispatching task {}", task.job_id, task.id))?;

        let outcome = dispatch::dispatch_to_queue(pool, task.id, task.status).await?;
        if outcome != tasks::TransitionOutcome::Applied {
            continue;
        }

        let envelope = dispatch::build_envelope(&job, &task);
        if !broker.input_blob_exists(task.id).await? {
            broker.set_input_blob(task.id, &task.input_file_bytes).await?;
        }
        broker.enqueue(&envelope).await?;
        report.dispatched += 1;
    }

    Ok(())
}

async fn score_all(
    pool: &PgPool,
    tasks: &[Task],
    now: chrono::DateTime<chrono::Utc>,
    thresholds: &Thresholds,
) -> Result<Vec<(Task, f64)>> {
    let mut scored = Vec::with_capacity(tasks.len());
    for task in tasks {
        let best_distance = best_distance_for(pool, task).await?;
        let s = priority::score(task, now, thresholds, best_distance);
        scored.push((task.clone(), s));
    }
    Ok(scored)
}

/// The parent lineage's best-known metric distance, for the fine-tune
/// branch of `PriorityFn` (`SPEC_FULL.md` §4.4). `None` for an `optimize`
/// task or a `fine_tune` task whose parent has no recorded metric yet.
async fn best_distance_for(pool: &PgPool, task: &Task) -> Result<Option<f64>> {
    if task.step_name != StepName::FineTune {
        return Ok(None);
    }
    let Some(metric_id) = task.best_prior_metric_id else {
        return Ok(None);
    };
    Ok(metrics::get_metric(pool, metric_id).await?.map(|m| m.distance))
}
