//! Task entities and the task state machine.
//!
//! A task moves forward through:
//! Pending → Queued → Processing → Completed/Failed/Cancelled,
//! with two loops back: Failed → Queued (retry) and
//! Paused → Queued (resume after a pause).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Task identifier: `"{job_id}_task_{index}"`.
pub type TaskId = String;

/// Dispatch priority. Higher levels drain first; within a level,
/// tasks dispatch in the order they were enqueued.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting on dependencies or on `start_job`.
    Pending,
    /// In the dispatch queue, eligible to run.
    Queued,
    /// An attempt is executing.
    Processing,
    /// Finished successfully.
    Completed,
    /// Failed with no retries left, or failed before it could run.
    Failed,
    /// Cancelled before completion.
    Cancelled,
    /// Held by a paused job while its attempt is (or was) in flight.
    Paused,
}

impl TaskStatus {
    /// Whether this state permits no further work on the task.
    ///
    /// `Failed` counts as terminal here: the retry loop re-enters `Queued`
    /// before anything else can observe the task, so an observed `Failed`
    /// is always final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check whether a transition to `target` is legal.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Queued)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Queued, TaskStatus::Processing)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Paused)
                | (TaskStatus::Failed, TaskStatus::Queued)
                | (TaskStatus::Paused, TaskStatus::Queued)
                | (TaskStatus::Paused, TaskStatus::Processing)
                | (TaskStatus::Paused, TaskStatus::Completed)
                | (TaskStatus::Paused, TaskStatus::Failed)
                | (TaskStatus::Paused, TaskStatus::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Reference to a dependency when describing a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRef {
    /// Index of another task in the same `JobSpec`.
    Sibling(usize),
    /// Full id of a task, possibly in another job.
    Id(TaskId),
}

/// Description of one task inside a job submission.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: String,
    pub payload: Value,
    pub priority: TaskPriority,
    /// Retry budget; engine default applies when `None`.
    pub max_retries: Option<u32>,
    /// Per-attempt timeout; engine default applies when `None`.
    pub timeout: Option<Duration>,
    pub depends_on: Vec<TaskRef>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, payload: Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::default(),
            max_retries: None,
            timeout: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Depend on the `index`-th task of the same submission.
    pub fn after_sibling(mut self, index: usize) -> Self {
        self.depends_on.push(TaskRef::Sibling(index));
        self
    }

    /// Depend on an already-created task, possibly in another job.
    pub fn after_task(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.push(TaskRef::Id(id.into()));
        self
    }
}

/// A tracked task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: Uuid,
    pub task_type: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// 0.0 until the task reaches a terminal state, 100.0 on completion.
    pub progress: f32,
    /// Retries consumed so far.
    pub retry_count: u32,
    pub max_retries: u32,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Resolved dependency ids; all must complete before dispatch.
    pub depends_on: Vec<TaskId>,
    /// Output of the successful attempt. Mutually exclusive with `error`.
    pub result: Option<Value>,
    /// Most recent failure. Retained while a retry is pending, cleared on success.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build the task id for the `index`-th task of a job.
    pub fn id_for(job_id: Uuid, index: usize) -> TaskId {
        format!("{job_id}_task_{index}")
    }

    pub(crate) fn new(
        job_id: Uuid,
        index: usize,
        task_type: String,
        payload: Value,
        priority: TaskPriority,
        max_retries: u32,
        timeout: Duration,
        depends_on: Vec<TaskId>,
    ) -> Self {
        Self {
            id: Self::id_for(job_id, index),
            job_id,
            task_type,
            payload,
            status: TaskStatus::Pending,
            priority,
            progress: 0.0,
            retry_count: 0,
            max_retries,
            timeout,
            depends_on,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Transition to a new status, updating timestamps and progress.
    ///
    /// Returns an error string when the transition is not legal.
    pub(crate) fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Invalid task transition from {} to {}",
                self.status, new_status
            ));
        }

        match new_status {
            TaskStatus::Processing => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed => {
                self.completed_at = Some(Utc::now());
                self.progress = 100.0;
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Queued => {
                // Re-entering the queue on retry leaves the terminal timestamp behind.
                self.completed_at = None;
            }
            _ => {}
        }

        self.status = new_status;
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            job_id: self.job_id,
            task_type: self.task_type.clone(),
            status: self.status,
            priority: self.priority,
            progress: self.progress,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only view of a task, as returned by status queries and events.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub job_id: Uuid,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress: f32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
