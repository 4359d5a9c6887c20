//! Database query functions for the `artifacts` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Artifact;

/// Parameters for inserting a new artifact row.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub task_id: Uuid,
    pub kind: String,
    pub payload: Vec<u8>,
    pub metric_id: Option<Uuid>,
}

/// Insert a byte blob produced by a task (parameter set, log, or report).
pub async fn insert_artifact(pool: &PgPool, new: &NewArtifact) -> Result<Artifact> {
    let artifact = sqlx::query_as::<_, Artifact>(
        "INSERT INTO artifacts (task_id, kind, payload, metric_id) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.kind)
    .bind(&new.payload)
    .bind(new.metric_id)
    .fetch_one(pool)
    .await
    .context("failed to insert artifact")?;

    Ok(artifact)
}

pub async fn get_artifact(pool: &PgPool, id: Uuid) -> Result<Option<Artifact>> {
    let artifact = sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch artifact")?;

    Ok(artifact)
}

/// The artifact of a given `kind` attached to a specific metric, e.g. the
/// parameter set ("output_set") that produced a winning evaluation
/// (`SPEC_FULL.md` §4.6/§4.8).
pub async fn get_artifact_for_metric(
    pool: &PgPool,
    metric_id: Uuid,
    kind: &str,
) -> Result<Option<Artifact>> {
    let artifact = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts WHERE metric_id = $1 AND kind = $2",
    )
    .bind(metric_id)
    .bind(kind)
    .fetch_optional(pool)
    .await
    .context("failed to fetch artifact for metric")?;

    Ok(artifact)
}

/// List every artifact attached to a task, oldest first.
pub async fn list_artifacts_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Artifact>> {
    let artifacts = sqlx::query_as::<_, Artifact>(
        "SELECT * FROM artifacts WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list artifacts for task")?;

    Ok(artifacts)
}
