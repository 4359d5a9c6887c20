use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Aggregate status of a job, derived from its tasks (see `optd_core::aggregate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    CompletedSuccess,
    CompletedPartial,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::CompletedSuccess => "completed_success",
            Self::CompletedPartial => "completed_partial",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed_success" => Ok(Self::CompletedSuccess),
            "completed_partial" => Ok(Self::CompletedPartial),
            "failed" => Ok(Self::Failed),
            other => Err(JobStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone)]
pub struct JobStatusParseError(pub String);

impl fmt::Display for JobStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job status: {:?}", self.0)
    }
}

impl std::error::Error for JobStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task in the ten-state machine (see `SPEC_FULL.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    New,
    Queued,
    WorkerInProgress,
    WorkerCompleted,
    WorkerFailed,
    Retrying,
    FineTuning,
    CompletedSuccess,
    CompletedPartial,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses are never mutated again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CompletedSuccess | Self::CompletedPartial | Self::Failed
        )
    }

    /// Statuses that make a job's aggregate status `IN_PROGRESS` (rule R1).
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::New | Self::Queued | Self::WorkerInProgress | Self::Retrying | Self::FineTuning
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::WorkerInProgress => "worker_in_progress",
            Self::WorkerCompleted => "worker_completed",
            Self::WorkerFailed => "worker_failed",
            Self::Retrying => "retrying",
            Self::FineTuning => "fine_tuning",
            Self::CompletedSuccess => "completed_success",
            Self::CompletedPartial => "completed_partial",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "queued" => Ok(Self::Queued),
            "worker_in_progress" => Ok(Self::WorkerInProgress),
            "worker_completed" => Ok(Self::WorkerCompleted),
            "worker_failed" => Ok(Self::WorkerFailed),
            "retrying" => Ok(Self::Retrying),
            "fine_tuning" => Ok(Self::FineTuning),
            "completed_success" => Ok(Self::CompletedSuccess),
            "completed_partial" => Ok(Self::CompletedPartial),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// The kind of evaluation pass a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Optimize,
    FineTune,
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Optimize => "optimize",
            Self::FineTune => "fine_tune",
        };
        f.write_str(s)
    }
}

impl FromStr for StepName {
    type Err = StepNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optimize" => Ok(Self::Optimize),
            "fine_tune" => Ok(Self::FineTune),
            other => Err(StepNameParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepName`] string.
#[derive(Debug, Clone)]
pub struct StepNameParseError(pub String);

impl fmt::Display for StepNameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid step name: {:?}", self.0)
    }
}

impl std::error::Error for StepNameParseError {}

// ---------------------------------------------------------------------------

/// What triggered a reoptimize action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Auto,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerKind {
    type Err = TriggerKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(TriggerKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggerKind`] string.
#[derive(Debug, Clone)]
pub struct TriggerKindParseError(pub String);

impl fmt::Display for TriggerKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger kind: {:?}", self.0)
    }
}

impl std::error::Error for TriggerKindParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A user-initiated optimization request bound to a single input file.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    pub kind: String,
    pub symbol: String,
    pub timeframe: String,
    pub strategy_name: String,
    pub original_file_ref: String,
    pub status: JobStatus,
    pub max_attempts: i32,
    pub attempt_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single evaluation pass associated with a job.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub step_name: StepName,
    pub step_number: i32,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub fine_tune_depth: i32,
    pub priority: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub assigned_worker: Option<String>,
    pub input_file_path: String,
    pub input_file_bytes: Vec<u8>,
    pub best_prior_metric_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A scored evaluation result attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Metric {
    pub id: Uuid,
    pub task_id: Uuid,
    pub distance: f64,
    pub score: f64,
    pub other_fields: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A byte blob attached to a task or metric (typically a parameter file).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artifact {
    pub id: Uuid,
    pub task_id: Uuid,
    pub kind: String,
    pub payload: Vec<u8>,
    pub metric_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row for a reoptimize action.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReoptimizeHistory {
    pub id: Uuid,
    pub job_id: Uuid,
    pub metric_id: Uuid,
    pub trigger_kind: TriggerKind,
    pub user_id: String,
    pub job_status_snapshot: JobStatus,
    pub derivative_file_ref: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
