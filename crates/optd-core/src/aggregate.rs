//! Job status aggregation: deriving a job's aggregate status from the
//! statuses of its tasks (`SPEC_FULL.md` §4.1).
//!
//! This is a pure function over typed inputs, no database access, so it
//! can be exercised with plain unit tests. Callers (the Scheduler,
//! Watchdog, and Spawner, after any task transition) re-fetch a job's
//! task statuses and call this to decide whether the job itself needs
//! an update.

use optd_db::models::JobStatus;
use optd_db::models::TaskStatus;

/// Derive a job's aggregate status from the statuses of all of its tasks,
/// applying rules R1-R4 in order (first match wins).
///
/// `original_source/db_utils.py`'s `update_job_status` applies these in
/// exactly this order: any in-progress task always wins (R1), a single
/// success freezes the job even if siblings later fail (R2), all-failed
/// is a hard failure (R3), and anything else left over is a partial
/// success (R4).
///
/// Panics if `task_statuses` is empty -- a job with no tasks has no
/// aggregate status to compute, and callers must not invoke this before
/// a job's first task exists.
pub fn aggregate(task_statuses: &[TaskStatus]) -> JobStatus {
    assert!(
        !task_statuses.is_empty(),
        "aggregate() requires at least one task status"
    );

    // R1: any task still in flight keeps the job in progress.
    if task_statuses.iter().any(|s| s.is_in_progress()) {
        return JobStatus::InProgress;
    }

    // R2: a single completed_success task is enough, regardless of what
    // any sibling task did -- success freezes the job.
    if task_statuses
        .iter()
        .any(|s| matches!(s, TaskStatus::CompletedSuccess))
    {
        return JobStatus::CompletedSuccess;
    }

    // R3: every task is terminal and none succeeded; if all of them
    // failed outright, the job failed outright.
    if task_statuses
        .iter()
        .all(|s| matches!(s, TaskStatus::Failed))
    {
        return JobStatus::Failed;
    }

    // R4: terminal, no success, not all failed -- a mix of failed and
    // completed_partial tasks.
    JobStatus::CompletedPartial
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_in_progress_status_wins() {
        assert_eq!(
            aggregate(&[TaskStatus::Failed, TaskStatus::Queued]),
            JobStatus::InProgress
        );
        assert_eq!(
            aggregate(&[TaskStatus::CompletedSuccess, TaskStatus::Retrying]),
            JobStatus::InProgress
        );
    }

    #[test]
    fn single_success_freezes_the_job() {
        assert_eq!(
            aggregate(&[TaskStatus::CompletedSuccess, TaskStatus::Failed]),
            JobStatus::CompletedSuccess
        );
        assert_eq!(
            aggregate(&[TaskStatus::Failed, TaskStatus::CompletedSuccess, TaskStatus::Failed]),
            JobStatus::CompletedSuccess
        );
    }

    #[test]
    fn all_failed_is_hard_failure() {
        assert_eq!(
            aggregate(&[TaskStatus::Failed, TaskStatus::Failed]),
            JobStatus::Failed
        );
        assert_eq!(aggregate(&[TaskStatus::Failed]), JobStatus::Failed);
    }

    #[test]
    fn mixed_terminal_without_success_is_partial() {
        assert_eq!(
            aggregate(&[TaskStatus::Failed, TaskStatus::CompletedPartial]),
            JobStatus::CompletedPartial
        );
        assert_eq!(
            aggregate(&[TaskStatus::CompletedPartial]),
            JobStatus::CompletedPartial
        );
    }

    #[test]
    #[should_panic(expected = "at least one task status")]
    fn empty_statuses_panics() {
        aggregate(&[]);
    }
}
