//! Fine-Tune Spawner (`SPEC_FULL.md` §4.6).
//!
//! Runs as a sub-step inside the Scheduler's iteration, after the
//! post-worker evaluation phase and before dispatch, so a task that just
//! became `COMPLETED_PARTIAL` this iteration can spawn its child in the
//! same pass (`SPEC_FULL.md` §4.5 step 3).

use anyhow::Result;
use optd_db::models::Task;
use optd_db::queries::{artifacts, metrics, tasks};
use optd_db::queries::tasks::NewTask;
use optd_db::thresholds::Thresholds;
use sqlx::PgPool;
use tracing::{info, warn};

const OUTPUT_SET_ARTIFACT_KIND: &str = "output_set";

/// Visit every `COMPLETED_PARTIAL` task (regardless of step) without an
/// existing fine-tune child and spawn one where the depth cap allows.
/// Returns the number of children actually created.
pub async fn run_once(pool: &PgPool, thresholds: &Thresholds) -> Result<usize> {
    let candidates = tasks::get_partial_tasks_without_fine_tune_child(pool, thresholds.max_fine_tune_depth).await?;

    let mut spawned = 0;
    for parent in candidates {
        match spawn_child(pool, &parent).await {
            Ok(Some(child_id)) => {
                info!(parent_id = %parent.id, child_id = %child_id, "spawned fine-tune child");
                spawned += 1;
            }
            Ok(None) => {}
            Err(err) if is_unique_violation(&err) => {
                // Another Spawner pass (or a racing process) already
                // created this parent's child between our existence check
                // and the insert; the unique index is the real guard here,
                // this is just the idempotent no-op path (§4.6).
                warn!(parent_id = %parent.id, "fine-tune child already exists, skipping");
            }
            Err(err) => return Err(err),
        }
    }

    Ok(spawned)
}

async fn spawn_child(pool: &PgPool, parent: &Task) -> Result<Option<uuid::Uuid>> {
    let best_metric = match metrics::get_best_metric_for_task(pool, parent.id).await? {
        Some(metric) => metric,
        None => return Ok(None),
    };

    let seed_bytes = artifacts::get_artifact_for_metric(pool, best_metric.id, OUTPUT_SET_ARTIFACT_KIND)
        .await?
        .map(|artifact| artifact.payload)
        .unwrap_or_else(|| parent.input_file_bytes.clone());

    let child = tasks::insert_fine_tune_child(
        pool,
        &NewTask {
            job_id: parent.job_id,
            parent_task_id: Some(parent.id),
            step_name: optd_db::models::StepName::FineTune,
            step_number: parent.step_number + 1,
            max_attempts: parent.max_attempts,
            fine_tune_depth: parent.fine_tune_depth + 1,
            priority: parent.priority,
            input_file_path: parent.input_file_path.clone(),
            input_file_bytes: seed_bytes,
            best_prior_metric_id: Some(best_metric.id),
        },
    )
    .await?;

    Ok(Some(child.id))
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<sqlx::Error>())
        .any(|sqlx_err| matches!(sqlx_err.as_database_error(), Some(db_err) if db_err.code().as_deref() == Some("23505")))
}
