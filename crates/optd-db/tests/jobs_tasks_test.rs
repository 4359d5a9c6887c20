//! Integration tests for job/task/metric/artifact CRUD and the
//! state-machine support queries (`SPEC_FULL.md` §3, §4).

use optd_db::models::{JobStatus, StepName, TaskStatus};
use optd_db::queries::artifacts::{self, NewArtifact};
use optd_db::queries::jobs::{self, NewJob};
use optd_db::queries::metrics::{self, NewMetric};
use optd_db::queries::tasks::{self, NewTask, TransitionOutcome};

use optd_test_utils::{create_test_db, drop_test_db};

fn new_job() -> NewJob {
    NewJob {
        owner_id: "operator-1".to_owned(),
        symbol: "EURUSD".to_owned(),
        timeframe: "H1".to_owned(),
        strategy_name: "TrendFollower".to_owned(),
        original_file_ref: "alpha.set".to_owned(),
        max_attempts: 3,
    }
}

fn new_task(job_id: uuid::Uuid) -> NewTask {
    NewTask {
        job_id,
        parent_task_id: None,
        step_name: StepName::Optimize,
        step_number: 1,
        max_attempts: 3,
        fine_tune_depth: 0,
        priority: 10.0,
        input_file_path: "alpha.set".to_owned(),
        input_file_bytes: b"param bytes".to_vec(),
        best_prior_metric_id: None,
    }
}

#[tokio::test]
async fn insert_and_fetch_job() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert");
    assert_eq!(job.status, JobStatus::InProgress);

    let fetched = jobs::get_job(&pool, job.id)
        .await
        .expect("fetch")
        .expect("job should exist");
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.symbol, "EURUSD");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn new_task_starts_in_new_status() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.expect("insert task");

    assert_eq!(task.status, TaskStatus::New);
    assert_eq!(task.attempt_count, 0);
    assert_eq!(task.job_id, job.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dispatch_task_bumps_attempt_count_only_from_retrying() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.expect("insert task");

    // NEW -> QUEUED: no attempt bump.
    let mut tx = pool.begin().await.unwrap();
    let outcome = tasks::dispatch_task(&mut tx, task.id, TaskStatus::New).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    let queued = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(queued.status, TaskStatus::Queued);
    assert_eq!(queued.attempt_count, 0);

    // Simulate a retry cycle: put it back in RETRYING, then dispatch again.
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, task.id, TaskStatus::Queued, TaskStatus::WorkerInProgress)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(
        &mut tx,
        task.id,
        TaskStatus::WorkerInProgress,
        TaskStatus::WorkerFailed,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, task.id, TaskStatus::WorkerFailed, TaskStatus::Retrying)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let outcome = tasks::dispatch_task(&mut tx, task.id, TaskStatus::Retrying).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(outcome, TransitionOutcome::Applied);

    let redispatched = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(redispatched.status, TaskStatus::Queued);
    assert_eq!(redispatched.attempt_count, 1, "attempt_count increments only on RETRYING -> QUEUED dispatch");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn transition_task_status_is_optimistically_locked() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.expect("insert task");

    // The task is `new`; trying to transition as if it were `queued` must
    // report a status mismatch, not silently apply.
    let mut tx = pool.begin().await.unwrap();
    let outcome = tasks::transition_task_status(
        &mut tx,
        task.id,
        TaskStatus::Queued,
        TaskStatus::WorkerInProgress,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outcome, TransitionOutcome::StatusMismatch);

    let unchanged = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, TaskStatus::New);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_queueable_tasks_excludes_terminal_and_in_flight() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let new_t = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();
    let queued_t = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::dispatch_task(&mut tx, queued_t.id, TaskStatus::New).await.unwrap();
    tx.commit().await.unwrap();

    let queueable = tasks::get_queueable_tasks(&pool, 10).await.unwrap();
    let ids: Vec<_> = queueable.iter().map(|t| t.id).collect();
    assert!(ids.contains(&new_t.id));
    assert!(!ids.contains(&queued_t.id), "queued tasks are not queueable again");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn fine_tune_child_uniqueness_is_enforced_at_the_db_level() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let parent = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut child = new_task(job.id);
    child.parent_task_id = Some(parent.id);
    child.step_name = StepName::FineTune;
    child.fine_tune_depth = 1;

    let first_child = tasks::insert_fine_tune_child(&pool, &child).await.expect("first child");
    assert_eq!(first_child.status, TaskStatus::FineTuning);

    // A second fine-tune child for the same parent must violate the
    // partial unique index (`SPEC_FULL.md` §3 Task invariants).
    let second_attempt = tasks::insert_fine_tune_child(&pool, &child).await;
    assert!(second_attempt.is_err(), "duplicate fine-tune child should be rejected");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn best_metric_for_task_orders_by_distance_then_score() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    metrics::insert_metric(
        &pool,
        &NewMetric {
            task_id: task.id,
            distance: 0.2,
            score: 0.95,
            other_fields: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    let best = metrics::insert_metric(
        &pool,
        &NewMetric {
            task_id: task.id,
            distance: 0.05,
            score: 0.9,
            other_fields: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    let winner = metrics::get_best_metric_for_task(&pool, task.id)
        .await
        .unwrap()
        .expect("a best metric should exist");
    assert_eq!(winner.id, best.id, "lowest distance should win regardless of score");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn artifact_for_metric_round_trips() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();
    let metric = metrics::insert_metric(
        &pool,
        &NewMetric {
            task_id: task.id,
            distance: 0.05,
            score: 0.9,
            other_fields: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    artifacts::insert_artifact(
        &pool,
        &NewArtifact {
            task_id: task.id,
            kind: "output_set".to_owned(),
            payload: b"winning params".to_vec(),
            metric_id: Some(metric.id),
        },
    )
    .await
    .unwrap();

    let found = artifacts::get_artifact_for_metric(&pool, metric.id, "output_set")
        .await
        .unwrap()
        .expect("artifact should exist");
    assert_eq!(found.payload, b"winning params");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn watchdog_retry_does_not_resurrect_a_task_moved_on_concurrently() {
    // The Watchdog acts on a snapshot (`get_stuck_tasks`) that can go stale
    // by the time it writes. If the Scheduler already moved the task to a
    // terminal status in between, `watchdog_retry` must not silently
    // overwrite that with RETRYING (SPEC_FULL.md §3 "terminal statuses are
    // immutable", §8 P5).
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::dispatch_task(&mut tx, task.id, TaskStatus::New).await.unwrap();
    tx.commit().await.unwrap();
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, task.id, TaskStatus::Queued, TaskStatus::WorkerInProgress)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // The Watchdog's stale snapshot still thinks the task is WORKER_IN_PROGRESS...
    let stale_snapshot_status = TaskStatus::WorkerInProgress;

    // ...but the task actually raced ahead to a terminal status in the
    // meantime (worker completed, Scheduler accepted it as a success).
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(
        &mut tx,
        task.id,
        TaskStatus::WorkerInProgress,
        TaskStatus::WorkerCompleted,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, task.id, TaskStatus::WorkerCompleted, TaskStatus::CompletedSuccess)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let outcome = tasks::watchdog_retry(&mut tx, task.id, stale_snapshot_status).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outcome, TransitionOutcome::StatusMismatch, "CAS guard should reject the stale write");

    let unchanged = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, TaskStatus::CompletedSuccess, "terminal status must remain immutable");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn mark_failed_does_not_overwrite_a_task_moved_on_concurrently() {
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let task = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::dispatch_task(&mut tx, task.id, TaskStatus::New).await.unwrap();
    tx.commit().await.unwrap();
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, task.id, TaskStatus::Queued, TaskStatus::WorkerInProgress)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let stale_snapshot_status = TaskStatus::WorkerInProgress;

    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(
        &mut tx,
        task.id,
        TaskStatus::WorkerInProgress,
        TaskStatus::WorkerCompleted,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, task.id, TaskStatus::WorkerCompleted, TaskStatus::CompletedPartial)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let outcome = tasks::mark_failed(&mut tx, task.id, stale_snapshot_status, "watchdog: stuck").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outcome, TransitionOutcome::StatusMismatch);

    let unchanged = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, TaskStatus::CompletedPartial, "terminal status must remain immutable");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_partial_tasks_without_fine_tune_child_includes_fine_tune_parents() {
    // SPEC_FULL.md §4.6: "for every task in COMPLETED_PARTIAL", gated only
    // by fine_tune_depth -- a fine_tune task landing COMPLETED_PARTIAL must
    // still be an eligible spawn candidate, or a lineage silently caps at
    // depth 1 no matter how MAX_FINE_TUNE_DEPTH is configured.
    let (pool, db_name) = create_test_db().await;

    let job = jobs::insert_job(&pool, &new_job()).await.expect("insert job");
    let root = tasks::insert_task(&pool, &new_task(job.id)).await.unwrap();

    let mut fine_tune_child = new_task(job.id);
    fine_tune_child.parent_task_id = Some(root.id);
    fine_tune_child.step_name = StepName::FineTune;
    fine_tune_child.fine_tune_depth = 1;
    let child = tasks::insert_fine_tune_child(&pool, &fine_tune_child).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    tasks::dispatch_task(&mut tx, child.id, TaskStatus::FineTuning).await.unwrap();
    tx.commit().await.unwrap();
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, child.id, TaskStatus::Queued, TaskStatus::WorkerInProgress)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, child.id, TaskStatus::WorkerInProgress, TaskStatus::WorkerCompleted)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    let mut tx = pool.begin().await.unwrap();
    tasks::transition_task_status(&mut tx, child.id, TaskStatus::WorkerCompleted, TaskStatus::CompletedPartial)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let candidates = tasks::get_partial_tasks_without_fine_tune_child(&pool, 2).await.unwrap();
    let ids: Vec<_> = candidates.iter().map(|t| t.id).collect();
    assert!(ids.contains(&child.id), "a fine_tune task in COMPLETED_PARTIAL must be a spawn candidate");

    pool.close().await;
    drop_test_db(&db_name).await;
}
