//! Ingestor (`SPEC_FULL.md` §4.10, §6.1).
//!
//! Thin by design: this module does not parse `.set` file internals (that
//! stays the worker's concern, per §1's Non-goals). It only validates the
//! JSON sidecar, creates the Job+Task pair, and moves the source file out
//! of the watch path so a second pass over the directory never reprocesses
//! it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use optd_db::queries::jobs::{self, NewJob};
use optd_db::queries::tasks::{self, NewTask};
use optd_db::models::StepName;
use optd_db::thresholds::Thresholds;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::notifier::Notifier;

/// The `<name>.set.meta.json` sidecar contract (§6.1).
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarMetadata {
    pub user_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub ea_name: String,
    pub original_filename: String,
    #[serde(default)]
    pub reoptimize_source_metric_id: Option<Uuid>,
    #[serde(default)]
    pub reoptimize_source_job_id: Option<Uuid>,
}

impl SidecarMetadata {
    fn is_reoptimize_source(&self) -> bool {
        self.reoptimize_source_metric_id.is_some() || self.reoptimize_source_job_id.is_some()
    }
}

/// Result of attempting to ingest one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A Job+Task pair was created.
    Created { job_id: Uuid, task_id: Uuid },
    /// The file was rejected and left for manual review; nothing was created.
    Rejected { reason: String },
}

/// The sidecar path for a given `.set` file: `<name>.set.meta.json`.
pub fn sidecar_path_for(set_path: &Path) -> PathBuf {
    let mut name = set_path.as_os_str().to_owned();
    name.push(".meta.json");
    PathBuf::from(name)
}

/// Ingest a single `.set` file sitting in `handoff_dir`, given its sidecar.
///
/// On success, moves both the `.set` file and its sidecar into
/// `handoff_dir/processed/`. On a validation error, the file is left in
/// place and the caller is notified; no Job/Task is created.
pub async fn ingest_file(
    pool: &PgPool,
    thresholds: &Thresholds,
    notifier: &dyn Notifier,
    handoff_dir: &Path,
    set_path: &Path,
) -> Result<IngestOutcome> {
    let sidecar_path = sidecar_path_for(set_path);

    let metadata = match read_sidecar(&sidecar_path).await {
        Ok(metadata) => metadata,
        Err(err) => {
            let reason = format!("malformed sidecar for {}: {err:#}", set_path.display());
            warn!(file = %set_path.display(), %err, "rejecting ingestion candidate");
            notifier
                .notify("Ingestion validation failed", &reason)
                .await;
            return Ok(IngestOutcome::Rejected { reason });
        }
    };

    let original_file_ref = metadata.original_filename.clone();
    if jobs::job_exists_for_file_ref(pool, &original_file_ref).await? && !metadata.is_reoptimize_source() {
        let reason = format!("duplicate file path {original_file_ref} without a reoptimize source");
        warn!(file = %original_file_ref, "rejecting duplicate ingestion candidate");
        notifier
            .notify("Ingestion rejected: duplicate file", &reason)
            .await;
        return Ok(IngestOutcome::Rejected { reason });
    }

    let file_bytes = tokio::fs::read(set_path)
        .await
        .with_context(|| format!("failed to read parameter file {}", set_path.display()))?;

    let job = jobs::insert_job(
        pool,
        &NewJob {
            owner_id: metadata.user_id.clone(),
            symbol: metadata.symbol.clone(),
            timeframe: metadata.timeframe.clone(),
            strategy_name: metadata.ea_name.clone(),
            original_file_ref,
            max_attempts: thresholds.task_max_attempts,
        },
    )
    .await
    .context("failed to insert job during ingestion")?;

    let task = tasks::insert_task(
        pool,
        &NewTask {
            job_id: job.id,
            parent_task_id: None,
            step_name: StepName::Optimize,
            step_number: 0,
            max_attempts: thresholds.task_max_attempts,
            fine_tune_depth: 0,
            priority: 10.0,
            input_file_path: metadata.original_filename.clone(),
            input_file_bytes: file_bytes,
            best_prior_metric_id: None,
        },
    )
    .await
    .context("failed to insert task during ingestion")?;

    move_to_processed(handoff_dir, set_path, &sidecar_path).await?;

    info!(job_id = %job.id, task_id = %task.id, "ingested new job");
    Ok(IngestOutcome::Created {
        job_id: job.id,
        task_id: task.id,
    })
}

async fn read_sidecar(sidecar_path: &Path) -> Result<SidecarMetadata> {
    let contents = tokio::fs::read_to_string(sidecar_path)
        .await
        .with_context(|| format!("failed to read sidecar {}", sidecar_path.display()))?;
    serde_json::from_str(&contents).context("failed to parse sidecar JSON")
}

async fn move_to_processed(handoff_dir: &Path, set_path: &Path, sidecar_path: &Path) -> Result<()> {
    let processed_dir = handoff_dir.join("processed");
    tokio::fs::create_dir_all(&processed_dir)
        .await
        .with_context(|| format!("failed to create {}", processed_dir.display()))?;

    if let Some(name) = set_path.file_name() {
        let dest = processed_dir.join(name);
        tokio::fs::rename(set_path, &dest)
            .await
            .with_context(|| format!("failed to move {} to {}", set_path.display(), dest.display()))?;
    }
    if sidecar_path.exists() {
        if let Some(name) = sidecar_path.file_name() {
            let dest = processed_dir.join(name);
            tokio::fs::rename(sidecar_path, &dest)
                .await
                .with_context(|| format!("failed to move {} to {}", sidecar_path.display(), dest.display()))?;
        }
    }
    Ok(())
}

/// Scan `handoff_dir` for `.set` files not already under `processed/` and
/// ingest each one. Used by both the `optd ingest` CLI command (pointed at
/// a single file's parent directory) and, in principle, a directory-watch
/// loop.
pub async fn scan_and_ingest(
    pool: &PgPool,
    thresholds: &Thresholds,
    notifier: &dyn Notifier,
    handoff_dir: &Path,
) -> Result<Vec<IngestOutcome>> {
    let mut outcomes = Vec::new();
    let mut entries = tokio::fs::read_dir(handoff_dir)
        .await
        .with_context(|| format!("failed to read handoff directory {}", handoff_dir.display()))?;

    while let Some(entry) = entries.next_entry().await.context("failed to read directory entry")? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("set") {
            continue;
        }
        let outcome = ingest_file(pool, thresholds, notifier, handoff_dir, &path).await?;
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_path_appends_meta_json() {
        let set_path = Path::new("/handoff/alpha.set");
        assert_eq!(
            sidecar_path_for(set_path),
            PathBuf::from("/handoff/alpha.set.meta.json")
        );
    }

    #[test]
    fn sidecar_without_reoptimize_fields_is_not_a_reoptimize_source() {
        let metadata = SidecarMetadata {
            user_id: "u".to_owned(),
            symbol: "EURUSD".to_owned(),
            timeframe: "H1".to_owned(),
            ea_name: "Trend".to_owned(),
            original_filename: "alpha.set".to_owned(),
            reoptimize_source_metric_id: None,
            reoptimize_source_job_id: None,
        };
        assert!(!metadata.is_reoptimize_source());
    }

    #[test]
    fn sidecar_with_reoptimize_metric_id_is_a_reoptimize_source() {
        let metadata = SidecarMetadata {
            user_id: "u".to_owned(),
            symbol: "EURUSD".to_owned(),
            timeframe: "H1".to_owned(),
            ea_name: "Trend".to_owned(),
            original_filename: "alpha.set".to_owned(),
            reoptimize_source_metric_id: Some(Uuid::new_v4()),
            reoptimize_source_job_id: None,
        };
        assert!(metadata.is_reoptimize_source());
    }
}
