//! Integration tests for the worker completion callback wrappers
//! (`SPEC_FULL.md` §4.11), against a real Postgres and Redis instance.

use optd_db::models::{StepName, TaskStatus};
use optd_db::queries::jobs::{self, NewJob};
use optd_db::queries::tasks::{self, NewTask, TransitionOutcome};

use optd_core::state::dispatch::{worker_claims_task, worker_reports_completed, worker_reports_failed};

use optd_test_utils::{create_test_broker, create_test_db, drop_test_db};

fn new_job() -> NewJob {
    NewJob {
        owner_id: "operator-1".to_owned(),
        symbol: "EURUSD".to_owned(),
        timeframe: "H1".to_owned(),
        strategy_name: "TrendFollower".to_owned(),
        original_file_ref: format!("alpha-{}.set", uuid::Uuid::new_v4().simple()),
        max_attempts: 3,
    }
}

fn new_task(job_id: uuid::Uuid) -> NewTask {
    NewTask {
        job_id,
        parent_task_id: None,
        step_name: StepName::Optimize,
        step_number: 0,
        max_attempts: 3,
        fine_tune_depth: 0,
        priority: 10.0,
        input_file_path: "alpha.set".to_owned(),
        input_file_bytes: b"param bytes".to_vec(),
        best_prior_metric_id: None,
    }
}

#[tokio::test]
async fn worker_reports_completed_from_worker_in_progress() {
    let (pool, db_name) = create_test_db().await;
    let broker = create_test_broker().await;

    let job = jobs::insert_job(&pool, &new_job()).await.unwrap();
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::dispatch_task(&mut tx, task.id, TaskStatus::New).await.unwrap();
    tx.commit().await.unwrap();

    let outcome = worker_claims_task(&pool, task.id, "worker-1").await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    let outcome = worker_reports_completed(&pool, &broker, task.id).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    let task = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::WorkerCompleted);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_reports_completed_tolerates_a_missed_claim() {
    // The worker's claim callback never landed (or was lost); its
    // completion callback arrives while the task is still QUEUED. §4.11
    // requires this to still be accepted.
    let (pool, db_name) = create_test_db().await;
    let broker = create_test_broker().await;

    let job = jobs::insert_job(&pool, &new_job()).await.unwrap();
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::dispatch_task(&mut tx, task.id, TaskStatus::New).await.unwrap();
    tx.commit().await.unwrap();

    let outcome = worker_reports_completed(&pool, &broker, task.id).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    let task = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::WorkerCompleted);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_reports_failed_tolerates_a_missed_claim() {
    let (pool, db_name) = create_test_db().await;
    let broker = create_test_broker().await;

    let job = jobs::insert_job(&pool, &new_job()).await.unwrap();
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::dispatch_task(&mut tx, task.id, TaskStatus::New).await.unwrap();
    tx.commit().await.unwrap();

    let outcome = worker_reports_failed(&pool, &broker, task.id).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    let task = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::WorkerFailed);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_completion_callback_is_ignored_not_errored() {
    // Workers retry at-least-once: a second callback for a task already
    // resolved to a terminal-adjacent state must be a no-op, never an error.
    let (pool, db_name) = create_test_db().await;
    let broker = create_test_broker().await;

    let job = jobs::insert_job(&pool, &new_job()).await.unwrap();
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::dispatch_task(&mut tx, task.id, TaskStatus::New).await.unwrap();
    tx.commit().await.unwrap();

    let first = worker_reports_completed(&pool, &broker, task.id).await.unwrap();
    assert_eq!(first, TransitionOutcome::Applied);

    let second = worker_reports_completed(&pool, &broker, task.id).await.unwrap();
    assert_eq!(second, TransitionOutcome::StatusMismatch, "duplicate callback must not re-apply");

    let task = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::WorkerCompleted, "second callback left the task untouched");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn callback_against_a_new_task_is_ignored() {
    // A task still sitting in NEW has never been dispatched; a worker
    // claiming to have completed it is an unrelated-state callback.
    let (pool, db_name) = create_test_db().await;
    let broker = create_test_broker().await;

    let job = jobs::insert_job(&pool, &new_job()).await.unwrap();
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let outcome = worker_reports_completed(&pool, &broker, task.id).await.unwrap();
    assert_eq!(outcome, TransitionOutcome::StatusMismatch);

    let task = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::New);

    pool.close().await;
    drop_test_db(&db_name).await;
}
