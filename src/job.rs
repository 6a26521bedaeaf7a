//! Job entities — named batches of tasks with shared execution policy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{TaskId, TaskSpec};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet started.
    Pending,
    /// Started; tasks are queued or running.
    Processing,
    /// Held by `pause_job` or by an error with `pause_on_error`.
    Paused,
    /// Every task reached a terminal state.
    Completed,
    /// Cancelled before completion.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Check whether a transition to `target` is legal.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Paused)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Cancelled)
                | (JobStatus::Paused, JobStatus::Processing)
                | (JobStatus::Paused, JobStatus::Completed)
                | (JobStatus::Paused, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Description of a job submission.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub tasks: Vec<TaskSpec>,
    /// Per-job concurrency cap; engine default applies when `None`.
    pub concurrency_limit: Option<usize>,
    /// Whether failed tasks are retried (within their retry budget).
    pub auto_retry_failed: bool,
    /// Whether a terminal task failure pauses the whole job.
    pub pause_on_error: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            name: name.into(),
            tasks,
            concurrency_limit: None,
            auto_retry_failed: true,
            pause_on_error: false,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_auto_retry(mut self, auto_retry_failed: bool) -> Self {
        self.auto_retry_failed = auto_retry_failed;
        self
    }

    pub fn with_pause_on_error(mut self, pause_on_error: bool) -> Self {
        self.pause_on_error = pause_on_error;
        self
    }
}

/// A tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    /// Ids of the job's tasks, in submission order.
    pub task_ids: Vec<TaskId>,
    /// Maximum tasks of this job processing at once.
    pub concurrency_limit: usize,
    pub auto_retry_failed: bool,
    pub pause_on_error: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(
        name: String,
        concurrency_limit: usize,
        auto_retry_failed: bool,
        pause_on_error: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            status: JobStatus::Pending,
            task_ids: Vec::new(),
            concurrency_limit,
            auto_retry_failed,
            pause_on_error,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Transition to a new status, updating timestamps.
    ///
    /// Returns an error string when the transition is not legal.
    pub(crate) fn transition_to(&mut self, new_status: JobStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Invalid job transition from {} to {}",
                self.status, new_status
            ));
        }

        match new_status {
            JobStatus::Processing => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            JobStatus::Completed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        self.status = new_status;
        Ok(())
    }

    pub(crate) fn summary(&self, progress: f32) -> JobSummary {
        JobSummary {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            progress,
            total_tasks: self.task_ids.len(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Per-status task tally for a job.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskStatusCounts {
    pub pending: usize,
    pub queued: usize,
    pub processing: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl TaskStatusCounts {
    /// Tasks that will never run again.
    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Compact job view, as carried by events and listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    /// Share of tasks in a terminal state, 0–100.
    pub progress: f32,
    pub total_tasks: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Full job view, as returned by `get_job_status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusSnapshot {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    /// Share of tasks in a terminal state, 0–100.
    pub progress: f32,
    pub tasks: TaskStatusCounts,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatusSnapshot {
    /// Wall-clock time between start and completion (or now, if still running).
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.completed_at.unwrap_or_else(Utc::now) - started)
    }
}
