//! Engine events and collaborator callbacks.
//!
//! Every task or job status change is published on the engine's broadcast
//! channel. Registered callbacks receive the same information synchronously,
//! outside the engine's internal locks.

use std::sync::Arc;

use serde::Serialize;

use crate::job::JobSummary;
use crate::task::TaskSnapshot;

/// Events emitted on the engine broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A task changed status (includes progress and retry updates).
    TaskUpdated {
        task: TaskSnapshot,
        job: JobSummary,
    },
    /// A job changed status.
    JobUpdated { job: JobSummary },
    /// A job reached `Completed`. Emitted exactly once per job.
    JobCompleted { job: JobSummary },
}

/// Task-level progress notification.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub task: TaskSnapshot,
    pub job: JobSummary,
}

/// Called on every task status change.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Called once when a job completes.
pub type CompletionCallback = Arc<dyn Fn(&JobSummary) + Send + Sync>;
