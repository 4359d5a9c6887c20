//! Database query functions for the `metrics` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Metric;

/// Parameters for inserting a new metric row.
#[derive(Debug, Clone)]
pub struct NewMetric {
    pub task_id: Uuid,
    pub distance: f64,
    pub score: f64,
    pub other_fields: serde_json::Value,
}

/// Insert the metric a worker reported for a task.
pub async fn insert_metric(pool: &PgPool, new: &NewMetric) -> Result<Metric> {
    let metric = sqlx::query_as::<_, Metric>(
        "INSERT INTO metrics (task_id, distance, score, other_fields) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.distance)
    .bind(new.score)
    .bind(&new.other_fields)
    .fetch_one(pool)
    .await
    .context("failed to insert metric")?;

    Ok(metric)
}

/// List every metric recorded for a task, most recent first.
pub async fn list_metrics_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Metric>> {
    let metrics = sqlx::query_as::<_, Metric>(
        "SELECT * FROM metrics WHERE task_id = $1 ORDER BY created_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list metrics for task")?;

    Ok(metrics)
}

/// The best metric for a task, ranked by lowest distance then highest
/// score, matching the Fine-Tune Spawner's own selection rule
/// (`SPEC_FULL.md` §4.6).
pub async fn get_best_metric_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Metric>> {
    let metric = sqlx::query_as::<_, Metric>(
        "SELECT * FROM metrics WHERE task_id = $1 \
         ORDER BY distance ASC, score DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch best metric for task")?;

    Ok(metric)
}

pub async fn get_metric(pool: &PgPool, id: Uuid) -> Result<Option<Metric>> {
    let metric = sqlx::query_as::<_, Metric>("SELECT * FROM metrics WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch metric")?;

    Ok(metric)
}
