//! Task state transitions (`SPEC_FULL.md` §4.2).
//!
//! Validates the ten-state transition graph, then delegates to
//! `optd_db::queries::tasks`'s optimistic-lock writes and recomputes the
//! owning Job's aggregate status in the same transaction. Every
//! transition is followed by a Job recompute; every transition into a
//! terminal state is followed by releasing the task's input-blob entry
//! from the Broker.

pub mod dispatch;

use anyhow::{Context, Result};
use optd_broker::Broker;
use optd_db::models::TaskStatus;
use optd_db::queries::tasks::TransitionOutcome;
use optd_db::queries::{jobs, tasks};
use sqlx::PgPool;
use uuid::Uuid;

use crate::aggregate::aggregate;

/// The ten-state task machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// new            -> queued
/// queued         -> worker_in_progress | worker_completed | worker_failed
/// worker_in_progress -> worker_completed | worker_failed
/// worker_completed -> completed_success | completed_partial | retrying | failed
/// worker_failed  -> retrying | failed
/// retrying       -> queued
/// fine_tuning    -> queued
/// ```
/// (`new`/`retrying`/`fine_tuning` all terminate at the same `queued`
/// edge via the Scheduler's dispatch phase. `queued -> worker_completed`
/// and `queued -> worker_failed` exist for the worker completion
/// callback (§4.11): an at-least-once worker may report completion
/// before the controller ever observed its claim.)
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (New, Queued)
                | (Retrying, Queued)
                | (FineTuning, Queued)
                | (Queued, WorkerInProgress)
                | (Queued, WorkerCompleted)
                | (Queued, WorkerFailed)
                | (WorkerInProgress, WorkerCompleted)
                | (WorkerInProgress, WorkerFailed)
                | (WorkerCompleted, CompletedSuccess)
                | (WorkerCompleted, CompletedPartial)
                | (WorkerCompleted, Retrying)
                | (WorkerCompleted, Failed)
                | (WorkerFailed, Retrying)
                | (WorkerFailed, Failed)
        )
    }

    /// Execute a validated state transition, then recompute the owning
    /// Job's aggregate status in the same database transaction. If the
    /// transition lands on a terminal status, release the task's
    /// input-blob entry from the Broker afterward.
    ///
    /// Returns the underlying [`TransitionOutcome`] so callers (the
    /// Scheduler, Watchdog, and Spawner, all of which may race on the
    /// same row) can treat `StatusMismatch`/`NotFound` as "someone else
    /// already moved it" rather than a hard error.
    pub async fn transition(
        pool: &PgPool,
        broker: &Broker,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<TransitionOutcome> {
        if !Self::is_valid_transition(from, to) {
            anyhow::bail!("invalid task state transition: {from} -> {to} for task {task_id}");
        }

        let mut tx = pool.begin().await.context("failed to open transition transaction")?;

        let outcome = tasks::transition_task_status(&mut tx, task_id, from, to).await?;
        if outcome != TransitionOutcome::Applied {
            tx.commit().await.context("failed to commit no-op transition")?;
            return Ok(outcome);
        }

        Self::recompute_job_status_for_task(&mut tx, task_id).await?;

        tx.commit().await.context("failed to commit task transition")?;

        if to.is_terminal() {
            broker.delete_input_blob(task_id).await?;
        }

        Ok(outcome)
    }

    /// Recompute and persist the aggregate status of the job owning
    /// `task_id`, using the job row locked `FOR UPDATE` to serialize
    /// concurrent recomputes (`SPEC_FULL.md` §5).
    pub(crate) async fn recompute_job_status_for_task(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task_id: Uuid,
    ) -> Result<()> {
        let job_id: Uuid = sqlx::query_scalar("SELECT job_id FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_one(&mut **tx)
            .await
            .context("failed to look up job id for task")?;

        let job = jobs::lock_job_for_update(tx, job_id)
            .await?
            .with_context(|| format!("job {job_id} not found while recomputing status"))?;

        let statuses = tasks::list_task_statuses_for_job(tx, job_id).await?;
        let next_status = aggregate(&statuses);

        if next_status != job.status {
            jobs::set_job_status(tx, job_id, next_status).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optd_db::models::TaskStatus::*;

    #[test]
    fn dispatch_edges_are_valid() {
        assert!(TaskStateMachine::is_valid_transition(New, Queued));
        assert!(TaskStateMachine::is_valid_transition(Retrying, Queued));
        assert!(TaskStateMachine::is_valid_transition(FineTuning, Queued));
    }

    #[test]
    fn worker_lifecycle_edges_are_valid() {
        assert!(TaskStateMachine::is_valid_transition(Queued, WorkerInProgress));
        assert!(TaskStateMachine::is_valid_transition(
            WorkerInProgress,
            WorkerCompleted
        ));
        assert!(TaskStateMachine::is_valid_transition(WorkerInProgress, WorkerFailed));
    }

    #[test]
    fn worker_callback_can_skip_the_claim_edge() {
        // §4.11: a worker may report completion/failure before the
        // controller ever saw its claim.
        assert!(TaskStateMachine::is_valid_transition(Queued, WorkerCompleted));
        assert!(TaskStateMachine::is_valid_transition(Queued, WorkerFailed));
    }

    #[test]
    fn post_worker_resolution_edges_are_valid() {
        for to in [CompletedSuccess, CompletedPartial, Retrying, Failed] {
            assert!(TaskStateMachine::is_valid_transition(WorkerCompleted, to));
        }
        for to in [Retrying, Failed] {
            assert!(TaskStateMachine::is_valid_transition(WorkerFailed, to));
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for terminal in [CompletedSuccess, CompletedPartial, Failed] {
            for to in [New, Queued, WorkerInProgress, WorkerCompleted, WorkerFailed, Retrying, FineTuning] {
                assert!(!TaskStateMachine::is_valid_transition(terminal, to));
            }
        }
    }

    #[test]
    fn skipping_states_is_invalid() {
        assert!(!TaskStateMachine::is_valid_transition(New, WorkerInProgress));
        assert!(!TaskStateMachine::is_valid_transition(Queued, CompletedSuccess));
    }
}
