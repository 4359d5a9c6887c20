//! `optd status` command: aggregate job counts, or one job's task counts.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use optd_db::queries::{jobs, tasks};

/// Run the status command.
///
/// With no `job_id`, prints aggregate job counts by status. With a
/// `job_id`, prints that job's task counts by status instead.
pub async fn run_status(pool: &PgPool, job_id: Option<&str>) -> Result<()> {
    match job_id {
        Some(id_str) => run_job_status(pool, id_str).await,
        None => run_fleet_status(pool).await,
    }
}

async fn run_job_status(pool: &PgPool, job_id_str: &str) -> Result<()> {
    let job_id = Uuid::parse_str(job_id_str).with_context(|| format!("invalid job id: {job_id_str}"))?;

    let job = jobs::get_job(pool, job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))?;

    println!("Job: {} ({} / {} / {})", job.id, job.symbol, job.timeframe, job.strategy_name);
    println!("Status: {}", job.status);
    println!("Owner: {}", job.owner_id);
    println!();

    let counts = tasks::count_tasks_by_status_for_job(pool, job_id).await?;
    println!(
        "new={} queued={} worker_in_progress={} worker_completed={} worker_failed={} \
         retrying={} fine_tuning={} completed_success={} completed_partial={} failed={}",
        counts.new,
        counts.queued,
        counts.worker_in_progress,
        counts.worker_completed,
        counts.worker_failed,
        counts.retrying,
        counts.fine_tuning,
        counts.completed_success,
        counts.completed_partial,
        counts.failed,
    );

    Ok(())
}

async fn run_fleet_status(pool: &PgPool) -> Result<()> {
    let counts = jobs::count_jobs_by_status(pool).await?;
    let total = counts.in_progress + counts.completed_success + counts.completed_partial + counts.failed;

    println!("Jobs: {total} total");
    println!(
        "  in_progress={} completed_success={} completed_partial={} failed={}",
        counts.in_progress, counts.completed_success, counts.completed_partial, counts.failed,
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use optd_db::queries::jobs::NewJob;
    use optd_db::queries::tasks::NewTask;
    use optd_test_utils::{create_test_db, drop_test_db};

    fn new_job() -> NewJob {
        NewJob {
            owner_id: "operator-1".to_owned(),
            symbol: "EURUSD".to_owned(),
            timeframe: "H1".to_owned(),
            strategy_name: "TrendFollower".to_owned(),
            original_file_ref: format!("alpha-{}.set", Uuid::new_v4().simple()),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn run_status_with_unknown_job_id_errors() {
        let (pool, db_name) = create_test_db().await;

        let err = run_status(&pool, Some(&Uuid::new_v4().to_string())).await.unwrap_err();
        assert!(err.to_string().contains("not found"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn run_status_with_invalid_job_id_errors() {
        let (pool, db_name) = create_test_db().await;

        let err = run_status(&pool, Some("not-a-uuid")).await.unwrap_err();
        assert!(err.to_string().contains("invalid job id"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn run_status_fleet_wide_succeeds_with_no_jobs() {
        let (pool, db_name) = create_test_db().await;

        run_status(&pool, None).await.unwrap();

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn run_status_for_job_reports_new_task() {
        let (pool, db_name) = create_test_db().await;

        let job = jobs::insert_job(&pool, &new_job()).await.unwrap();
        tasks::insert_task(
            &pool,
            &NewTask {
                job_id: job.id,
                parent_task_id: None,
                step_name: optd_db::models::StepName::Optimize,
                step_number: 0,
                max_attempts: 3,
                fine_tune_depth: 0,
                priority: 10.0,
                input_file_path: "alpha.set".to_owned(),
                input_file_bytes: b"param bytes".to_vec(),
                best_prior_metric_id: None,
            },
        )
        .await
        .unwrap();

        run_status(&pool, Some(&job.id.to_string())).await.unwrap();

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
