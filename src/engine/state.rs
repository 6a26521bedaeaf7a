//! Mutable engine state — job table, task arena, dispatch queue, running set.
//!
//! All of this lives behind one `RwLock` owned by the engine. Every method
//! here runs under that lock and stays synchronous; notifications collect in
//! an [`Outbox`] and are delivered by the caller after the lock drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::{EngineEvent, ProgressUpdate};
use crate::job::{Job, JobStatus, JobSummary, TaskStatusCounts};
use crate::queue::{QueueEntry, TaskQueue};
use crate::task::{Task, TaskId, TaskStatus};

/// A task with an attempt in flight.
pub(crate) struct RunningTask {
    pub job_id: Uuid,
    /// Cooperative cancellation flag, shared with the attempt's `TaskContext`.
    pub cancelled: Arc<AtomicBool>,
    /// Worker handle; filled in right after spawn, drained on shutdown.
    pub handle: Option<JoinHandle<()>>,
}

/// Notifications collected under the state lock, delivered after it drops.
#[derive(Default)]
pub(crate) struct Outbox {
    pub events: Vec<EngineEvent>,
    pub progress: Vec<ProgressUpdate>,
    pub completed_jobs: Vec<JobSummary>,
}

/// Everything the dispatcher needs to run one attempt.
pub(crate) struct DispatchTicket {
    pub task_id: TaskId,
    pub job_id: Uuid,
    pub task_type: String,
    pub payload: Value,
    pub timeout: Duration,
    pub attempt: u32,
    pub cancelled: Arc<AtomicBool>,
}

/// How a task's dependencies currently stand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DepsState {
    /// Every dependency completed.
    Satisfied,
    /// At least one dependency is still in flight.
    Waiting,
    /// The named dependency will never complete.
    Doomed(TaskId),
}

pub(crate) struct EngineState {
    pub jobs: HashMap<Uuid, Job>,
    pub tasks: HashMap<TaskId, Task>,
    /// Reverse dependency edges: dependency id → tasks waiting on it.
    pub dependents: HashMap<TaskId, Vec<TaskId>>,
    pub queue: TaskQueue,
    pub running: HashMap<TaskId, RunningTask>,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            tasks: HashMap::new(),
            dependents: HashMap::new(),
            queue: TaskQueue::new(),
            running: HashMap::new(),
        }
    }

    /// Register a job and its tasks, wiring reverse dependency edges.
    pub fn insert_job(&mut self, job: Job, tasks: Vec<Task>) {
        for task in &tasks {
            for dep_id in &task.depends_on {
                self.dependents
                    .entry(dep_id.clone())
                    .or_default()
                    .push(task.id.clone());
            }
        }
        for task in tasks {
            self.tasks.insert(task.id.clone(), task);
        }
        self.jobs.insert(job.id, job);
    }

    /// Drop a job and its tasks, including their dependency edges.
    pub fn remove_job(&mut self, job_id: &Uuid) {
        let Some(job) = self.jobs.remove(job_id) else {
            return;
        };
        for task_id in &job.task_ids {
            if let Some(task) = self.tasks.remove(task_id) {
                for dep_id in &task.depends_on {
                    let now_empty = match self.dependents.get_mut(dep_id) {
                        Some(list) => {
                            list.retain(|t| t != task_id);
                            list.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        self.dependents.remove(dep_id);
                    }
                }
            }
            self.dependents.remove(task_id);
        }
    }

    // ── Views ──────────────────────────────────────────────────────────

    pub fn task_counts(&self, job: &Job) -> TaskStatusCounts {
        let mut counts = TaskStatusCounts {
            total: job.task_ids.len(),
            ..Default::default()
        };
        for task_id in &job.task_ids {
            let Some(task) = self.tasks.get(task_id) else {
                continue;
            };
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Paused => counts.paused += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Share of the job's tasks in a terminal state, 0–100.
    pub fn job_progress(&self, job: &Job) -> f32 {
        let total = job.task_ids.len();
        if total == 0 {
            return 0.0;
        }
        let counts = self.task_counts(job);
        counts.terminal() as f32 * 100.0 / total as f32
    }

    pub fn job_summary(&self, job: &Job) -> JobSummary {
        job.summary(self.job_progress(job))
    }

    pub fn running_count_for(&self, job_id: &Uuid) -> usize {
        self.running.values().filter(|r| r.job_id == *job_id).count()
    }

    // ── Outbox notes ───────────────────────────────────────────────────

    pub fn note_task_update(&self, task_id: &TaskId, outbox: &mut Outbox) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        let Some(job) = self.jobs.get(&task.job_id) else {
            return;
        };
        let task = task.snapshot();
        let job = self.job_summary(job);
        outbox.events.push(EngineEvent::TaskUpdated {
            task: task.clone(),
            job: job.clone(),
        });
        outbox.progress.push(ProgressUpdate { task, job });
    }

    pub fn note_job_update(&self, job_id: &Uuid, outbox: &mut Outbox) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        outbox.events.push(EngineEvent::JobUpdated {
            job: self.job_summary(job),
        });
    }

    // ── Dependency handling ────────────────────────────────────────────

    pub fn deps_state(&self, task: &Task) -> DepsState {
        let mut waiting = false;
        for dep_id in &task.depends_on {
            match self.tasks.get(dep_id) {
                // A dependency removed by cleanup can never complete.
                None => return DepsState::Doomed(dep_id.clone()),
                Some(dep) => match dep.status {
                    TaskStatus::Completed => {}
                    s if s.is_terminal() => return DepsState::Doomed(dep_id.clone()),
                    _ => waiting = true,
                },
            }
        }
        if waiting {
            DepsState::Waiting
        } else {
            DepsState::Satisfied
        }
    }

    /// Move a pending task into the dispatch queue.
    pub fn enqueue_task(&mut self, task_id: &TaskId, outbox: &mut Outbox) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        let priority = task.priority;
        if let Err(reason) = task.transition_to(TaskStatus::Queued) {
            tracing::error!(task_id = %task_id, %reason, "Refusing to enqueue task");
            return;
        }
        self.queue.push(task_id.clone(), priority);
        self.note_task_update(task_id, outbox);
    }

    /// Fail a still-pending task whose dependency will never complete.
    pub fn fail_unsatisfiable(
        &mut self,
        task_id: &TaskId,
        dep_id: &TaskId,
        outbox: &mut Outbox,
    ) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        if let Err(reason) = task.transition_to(TaskStatus::Failed) {
            tracing::error!(task_id = %task_id, %reason, "Dependency failure transition refused");
            return false;
        }
        task.error = Some(format!("unsatisfiable dependency: {dep_id}"));
        tracing::warn!(
            task_id = %task_id,
            dependency = %dep_id,
            "Task failed: dependency will never complete"
        );
        self.note_task_update(task_id, outbox);
        true
    }

    /// Fail every pending task that transitively depends on `root`.
    ///
    /// Returns the ids of the tasks that were failed, in walk order.
    pub fn doom_dependents(&mut self, root: &TaskId, outbox: &mut Outbox) -> Vec<TaskId> {
        let mut doomed = Vec::new();
        let mut stack: Vec<(TaskId, TaskId)> = Vec::new();
        if let Some(children) = self.dependents.get(root) {
            for child in children {
                stack.push((root.clone(), child.clone()));
            }
        }

        while let Some((dep_id, task_id)) = stack.pop() {
            if !self.fail_unsatisfiable(&task_id, &dep_id, outbox) {
                continue;
            }
            if let Some(children) = self.dependents.get(&task_id) {
                for child in children {
                    stack.push((task_id.clone(), child.clone()));
                }
            }
            doomed.push(task_id);
        }
        doomed
    }

    // ── Terminal fan-out ───────────────────────────────────────────────

    /// Follow-up work after a task completes: wake dependents whose last
    /// gate just opened, then settle the owning job if it is done.
    pub fn on_task_completed(&mut self, task_id: &TaskId, outbox: &mut Outbox) {
        let dependents = self.dependents.get(task_id).cloned().unwrap_or_default();
        for dependent_id in dependents {
            let ready = {
                let Some(task) = self.tasks.get(&dependent_id) else {
                    continue;
                };
                if task.status != TaskStatus::Pending {
                    continue;
                }
                let Some(job) = self.jobs.get(&task.job_id) else {
                    continue;
                };
                // Dependents of a not-yet-started or paused job wait for
                // start_job/resume_job to evaluate them.
                job.status == JobStatus::Processing
                    && self.deps_state(task) == DepsState::Satisfied
            };
            if ready {
                self.enqueue_task(&dependent_id, outbox);
            }
        }

        if let Some(task) = self.tasks.get(task_id) {
            let job_id = task.job_id;
            self.check_job_completion(&job_id, outbox);
        }
    }

    /// Follow-up work after a task fails terminally: propagate to dependents,
    /// apply pause-on-error, then settle the jobs that were touched.
    ///
    /// Returns the ids of dependents that were failed by propagation.
    pub fn on_terminal_failure(&mut self, task_id: &TaskId, outbox: &mut Outbox) -> Vec<TaskId> {
        let doomed = self.doom_dependents(task_id, outbox);

        let mut touched_jobs: Vec<Uuid> = Vec::new();
        for id in std::iter::once(task_id).chain(doomed.iter()) {
            if let Some(task) = self.tasks.get(id) {
                if !touched_jobs.contains(&task.job_id) {
                    touched_jobs.push(task.job_id);
                }
            }
        }

        for job_id in touched_jobs {
            self.maybe_pause_on_error(&job_id, outbox);
            self.check_job_completion(&job_id, outbox);
        }
        doomed
    }

    fn maybe_pause_on_error(&mut self, job_id: &Uuid, outbox: &mut Outbox) {
        let should_pause = {
            let Some(job) = self.jobs.get(job_id) else {
                return;
            };
            if !job.pause_on_error || job.status != JobStatus::Processing {
                return;
            }
            // A failure on the job's last open task settles the job instead.
            let counts = self.task_counts(job);
            counts.terminal() < counts.total
        };
        if !should_pause {
            return;
        }

        if let Some(job) = self.jobs.get_mut(job_id) {
            if let Err(reason) = job.transition_to(JobStatus::Paused) {
                tracing::error!(job_id = %job_id, %reason, "Pause-on-error transition refused");
                return;
            }
        }
        tracing::info!(job_id = %job_id, "Job paused after task failure");
        self.pause_running_tasks(job_id, outbox);
        self.note_job_update(job_id, outbox);
    }

    /// Mark the job's in-flight tasks Paused. Their attempts keep running;
    /// results are applied from the paused state when they settle.
    pub fn pause_running_tasks(&mut self, job_id: &Uuid, outbox: &mut Outbox) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let task_ids = job.task_ids.clone();
        for task_id in task_ids {
            let paused = {
                let Some(task) = self.tasks.get_mut(&task_id) else {
                    continue;
                };
                if task.status != TaskStatus::Processing {
                    continue;
                }
                task.transition_to(TaskStatus::Paused).is_ok()
            };
            if paused {
                self.note_task_update(&task_id, outbox);
            }
        }
    }

    /// Transition the job to Completed once every task is terminal.
    pub fn check_job_completion(&mut self, job_id: &Uuid, outbox: &mut Outbox) {
        let complete = {
            let Some(job) = self.jobs.get(job_id) else {
                return;
            };
            if job.status.is_terminal() || job.status == JobStatus::Pending {
                return;
            }
            let counts = self.task_counts(job);
            counts.terminal() == counts.total
        };
        if !complete {
            return;
        }

        if let Some(job) = self.jobs.get_mut(job_id) {
            if let Err(reason) = job.transition_to(JobStatus::Completed) {
                tracing::error!(job_id = %job_id, %reason, "Completion transition refused");
                return;
            }
        }
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let summary = self.job_summary(job);
        tracing::info!(job_id = %job_id, name = %summary.name, "Job completed");
        outbox.events.push(EngineEvent::JobCompleted {
            job: summary.clone(),
        });
        outbox.completed_jobs.push(summary);
    }

    // ── Dispatch ───────────────────────────────────────────────────────

    /// Pop the next dispatchable task and move it to Processing.
    ///
    /// Entries whose job is paused or at its concurrency limit are skipped
    /// and reinserted with their original sequence, so they keep their
    /// place in line. Stale entries (task gone, no longer queued, job
    /// terminal) are dropped.
    pub fn next_dispatch(&mut self, outbox: &mut Outbox) -> Option<DispatchTicket> {
        let mut skipped: Vec<QueueEntry> = Vec::new();
        let mut picked: Option<QueueEntry> = None;

        while let Some(entry) = self.queue.pop() {
            let Some(task) = self.tasks.get(&entry.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }
            let Some(job) = self.jobs.get(&task.job_id) else {
                continue;
            };
            match job.status {
                JobStatus::Paused => {
                    skipped.push(entry);
                    continue;
                }
                JobStatus::Processing => {}
                _ => continue,
            }
            if self.running_count_for(&task.job_id) >= job.concurrency_limit {
                skipped.push(entry);
                continue;
            }
            picked = Some(entry);
            break;
        }

        for entry in skipped {
            self.queue.reinsert(entry);
        }

        let entry = picked?;
        let ticket = {
            let Some(task) = self.tasks.get_mut(&entry.task_id) else {
                return None;
            };
            if let Err(reason) = task.transition_to(TaskStatus::Processing) {
                tracing::error!(task_id = %entry.task_id, %reason, "Dispatch transition refused");
                return None;
            }
            let cancelled = Arc::new(AtomicBool::new(false));
            DispatchTicket {
                task_id: task.id.clone(),
                job_id: task.job_id,
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                timeout: task.timeout,
                attempt: task.retry_count + 1,
                cancelled,
            }
        };

        self.running.insert(
            ticket.task_id.clone(),
            RunningTask {
                job_id: ticket.job_id,
                cancelled: ticket.cancelled.clone(),
                handle: None,
            },
        );
        self.note_task_update(&ticket.task_id, outbox);
        Some(ticket)
    }
}
