//! The JSON dispatch message placed on the Broker main queue (`SPEC_FULL.md`
//! §6.2).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single task dispatch envelope.
///
/// Field names are the wire contract: workers deserialize exactly this
/// shape, so renaming a field here is a breaking change for any worker
/// already in the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub job_id: Uuid,
    pub task_id: Uuid,
    pub set_file_name: String,
    pub input_blob_key: String,
    pub ea_name: String,
    pub symbol: String,
    pub timeframe: String,
}

impl Envelope {
    /// Build the envelope for a task, deriving `input_blob_key` from the
    /// task id per the fixed `task:<id>:input_blob` naming scheme.
    pub fn new(
        job_id: Uuid,
        task_id: Uuid,
        set_file_name: impl Into<String>,
        ea_name: impl Into<String>,
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            task_id,
            set_file_name: set_file_name.into(),
            input_blob_key: input_blob_key(task_id),
            ea_name: ea_name.into(),
            symbol: symbol.into(),
            timeframe: timeframe.into(),
        }
    }
}

/// The transient Broker key holding a task's parameter-file bytes
/// (`SPEC_FULL.md` §6.2, §6.3).
pub fn input_blob_key(task_id: Uuid) -> String {
    format!("task:{task_id}:input_blob")
}
