//! Task engine — job submission, scheduling, and lifecycle control.
//!
//! Core components:
//! - `state` — locked job/task tables, dispatch queue, running set
//! - `dispatch` — dispatch loop, attempt execution, retry handling
//!
//! The [`TaskEngine`] is the single entry point: collaborators register
//! processors, submit jobs, and observe progress through callbacks or the
//! event stream.

mod dispatch;
pub(crate) mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{JobError, Result, TaskError};
use crate::events::{
    CompletionCallback, EngineEvent, ProgressCallback, ProgressUpdate,
};
use crate::job::{Job, JobSpec, JobStatus, JobStatusSnapshot, JobSummary};
use crate::registry::{ProcessorRegistry, TaskProcessor};
use crate::stats::{EngineStats, StatsRecorder};
use crate::task::{Task, TaskRef, TaskSnapshot, TaskSpec, TaskStatus};

use state::{DepsState, EngineState, Outbox};

/// Batch task scheduling engine.
///
/// Constructed with [`TaskEngine::new`] and driven by [`TaskEngine::start`];
/// all operations are safe to call from any task or thread.
pub struct TaskEngine {
    pub(crate) config: EngineConfig,
    pub(crate) registry: ProcessorRegistry,
    pub(crate) state: RwLock<EngineState>,
    pub(crate) stats: StatsRecorder,
    /// Global worker slots; one held per in-flight attempt.
    pub(crate) worker_slots: Arc<Semaphore>,
    /// Poked whenever the queue may have gained a dispatchable task.
    pub(crate) queue_wake: Notify,
    running: AtomicBool,
    started: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    events_tx: broadcast::Sender<EngineEvent>,
    progress_callbacks: RwLock<Vec<ProgressCallback>>,
    completion_callbacks: RwLock<Vec<CompletionCallback>>,
}

impl TaskEngine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(config.event_capacity);
        Arc::new(Self {
            worker_slots: Arc::new(Semaphore::new(config.max_workers)),
            config,
            registry: ProcessorRegistry::new(),
            state: RwLock::new(EngineState::new()),
            stats: StatsRecorder::new(),
            queue_wake: Notify::new(),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            loop_handle: Mutex::new(None),
            events_tx,
            progress_callbacks: RwLock::new(Vec::new()),
            completion_callbacks: RwLock::new(Vec::new()),
        })
    }

    /// Start the dispatch loop. Idempotent.
    pub async fn start(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let handle = dispatch::spawn_dispatch_loop(Arc::clone(&self));
        *self.loop_handle.lock().await = Some(handle);
    }

    /// Stop dispatching and wait for in-flight attempts to settle.
    ///
    /// Queued tasks stay queued; nothing new is dispatched after this.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Engine shutting down");
        self.worker_slots.close();
        self.queue_wake.notify_waiters();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.write().await;
            state
                .running
                .values_mut()
                .filter_map(|running| running.handle.take())
                .collect()
        };
        if !handles.is_empty() {
            info!(in_flight = handles.len(), "Waiting for in-flight attempts");
            let _ = futures::future::join_all(handles).await;
        }
        info!("Engine stopped");
    }

    pub(crate) fn accepting(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Registration and observation ───────────────────────────────────

    /// Register a processor for a task type.
    pub async fn register_processor(
        &self,
        task_type: impl Into<String>,
        processor: Arc<dyn TaskProcessor>,
    ) {
        self.registry.register(task_type, processor).await;
    }

    /// Subscribe to the engine event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// Register a callback fired on every task status change.
    ///
    /// Callbacks run outside the engine's locks but on the dispatch path;
    /// keep them cheap.
    pub async fn add_progress_callback(
        &self,
        callback: impl Fn(&ProgressUpdate) + Send + Sync + 'static,
    ) {
        self.progress_callbacks.write().await.push(Arc::new(callback));
    }

    /// Register a callback fired once per completed job.
    pub async fn add_completion_callback(
        &self,
        callback: impl Fn(&JobSummary) + Send + Sync + 'static,
    ) {
        self.completion_callbacks
            .write()
            .await
            .push(Arc::new(callback));
    }

    /// Deliver collected notifications. Always called after the state lock
    /// has been released.
    pub(crate) async fn deliver(&self, outbox: Outbox) {
        for event in outbox.events {
            let _ = self.events_tx.send(event);
        }
        if !outbox.progress.is_empty() {
            let callbacks = self.progress_callbacks.read().await;
            for update in &outbox.progress {
                for callback in callbacks.iter() {
                    callback(update);
                }
            }
        }
        if !outbox.completed_jobs.is_empty() {
            let callbacks = self.completion_callbacks.read().await;
            for job in &outbox.completed_jobs {
                self.stats.record_job_completed();
                for callback in callbacks.iter() {
                    callback(job);
                }
            }
        }
    }

    // ── Job operations ─────────────────────────────────────────────────

    /// Create a job in `Pending` state and return its id.
    ///
    /// Validates the task list and every dependency reference; nothing is
    /// dispatched until `start_job`.
    pub async fn create_job(&self, spec: JobSpec) -> Result<Uuid> {
        if spec.tasks.is_empty() {
            return Err(JobError::EmptyTaskList { name: spec.name }.into());
        }

        let task_count = spec.tasks.len();
        for (index, task) in spec.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if let TaskRef::Sibling(dependency) = dep {
                    if *dependency == index {
                        return Err(JobError::SelfDependency { index }.into());
                    }
                    if *dependency >= task_count {
                        return Err(JobError::DependencyOutOfRange {
                            index,
                            dependency: *dependency,
                            count: task_count,
                        }
                        .into());
                    }
                }
            }
        }
        if let Some(index) = find_sibling_cycle(&spec.tasks) {
            return Err(JobError::DependencyCycle { index }.into());
        }

        let concurrency_limit = spec
            .concurrency_limit
            .unwrap_or(self.config.default_concurrency_limit)
            .max(1);

        let mut outbox = Outbox::default();
        let job_id = {
            let mut state = self.state.write().await;

            // Cross-job references must point at tasks that already exist.
            for (index, task) in spec.tasks.iter().enumerate() {
                for dep in &task.depends_on {
                    if let TaskRef::Id(id) = dep {
                        if !state.tasks.contains_key(id) {
                            return Err(JobError::UnknownDependency {
                                index,
                                id: id.clone(),
                            }
                            .into());
                        }
                    }
                }
            }

            let mut job = Job::new(
                spec.name,
                concurrency_limit,
                spec.auto_retry_failed,
                spec.pause_on_error,
            );
            let job_id = job.id;

            let mut tasks = Vec::with_capacity(task_count);
            for (index, task_spec) in spec.tasks.into_iter().enumerate() {
                let depends_on = task_spec
                    .depends_on
                    .iter()
                    .map(|dep| match dep {
                        TaskRef::Sibling(i) => Task::id_for(job_id, *i),
                        TaskRef::Id(id) => id.clone(),
                    })
                    .collect();
                let task = Task::new(
                    job_id,
                    index,
                    task_spec.task_type,
                    task_spec.payload,
                    task_spec.priority,
                    task_spec.max_retries.unwrap_or(self.config.default_max_retries),
                    task_spec.timeout.unwrap_or(self.config.default_task_timeout),
                    depends_on,
                );
                job.task_ids.push(task.id.clone());
                tasks.push(task);
            }

            state.insert_job(job, tasks);
            state.note_job_update(&job_id, &mut outbox);
            job_id
        };
        self.deliver(outbox).await;

        self.stats.record_job_created(task_count);
        info!(job_id = %job_id, tasks = task_count, "Job created");
        Ok(job_id)
    }

    /// Start a pending job: queue every task whose dependencies are already
    /// satisfied. Returns how many tasks were queued.
    pub async fn start_job(&self, job_id: &Uuid) -> Result<usize> {
        let (queued, outbox) = {
            let mut state = self.state.write().await;
            let mut outbox = Outbox::default();

            {
                let job = state
                    .jobs
                    .get_mut(job_id)
                    .ok_or(JobError::NotFound { id: *job_id })?;
                let status = job.status;
                if job.transition_to(JobStatus::Processing).is_err() {
                    return Err(JobError::InvalidState {
                        id: *job_id,
                        state: status.to_string(),
                        operation: "start".to_string(),
                    }
                    .into());
                }
            }
            state.note_job_update(job_id, &mut outbox);

            let task_ids = state
                .jobs
                .get(job_id)
                .map(|job| job.task_ids.clone())
                .unwrap_or_default();

            let mut queued = 0usize;
            let mut doomed_roots = Vec::new();
            for task_id in task_ids {
                let verdict = {
                    let Some(task) = state.tasks.get(&task_id) else {
                        continue;
                    };
                    if task.status != TaskStatus::Pending {
                        continue;
                    }
                    state.deps_state(task)
                };
                match verdict {
                    DepsState::Satisfied => {
                        state.enqueue_task(&task_id, &mut outbox);
                        queued += 1;
                    }
                    DepsState::Waiting => {}
                    DepsState::Doomed(dep_id) => {
                        if state.fail_unsatisfiable(&task_id, &dep_id, &mut outbox) {
                            doomed_roots.push(task_id);
                        }
                    }
                }
            }

            let mut failed = doomed_roots.len();
            for root in doomed_roots {
                failed += state.on_terminal_failure(&root, &mut outbox).len();
            }
            for _ in 0..failed {
                self.stats.record_task_failed();
            }

            // Every task may already be terminal (cancelled or doomed
            // dependencies); settle the job rather than leaving it open.
            state.check_job_completion(job_id, &mut outbox);

            (queued, outbox)
        };
        self.deliver(outbox).await;
        self.queue_wake.notify_one();

        info!(job_id = %job_id, queued, "Job started");
        Ok(queued)
    }

    /// Pause a processing job. In-flight attempts keep running and settle
    /// from the paused state; queued tasks are held until resume.
    pub async fn pause_job(&self, job_id: &Uuid) -> Result<()> {
        let outbox = {
            let mut state = self.state.write().await;
            let mut outbox = Outbox::default();

            {
                let job = state
                    .jobs
                    .get_mut(job_id)
                    .ok_or(JobError::NotFound { id: *job_id })?;
                let status = job.status;
                if job.transition_to(JobStatus::Paused).is_err() {
                    return Err(JobError::InvalidState {
                        id: *job_id,
                        state: status.to_string(),
                        operation: "pause".to_string(),
                    }
                    .into());
                }
            }
            state.pause_running_tasks(job_id, &mut outbox);
            state.note_job_update(job_id, &mut outbox);
            outbox
        };
        self.deliver(outbox).await;

        info!("Paused job {}", job_id);
        Ok(())
    }

    /// Resume a paused job: re-queue its paused tasks and re-evaluate
    /// pending ones.
    pub async fn resume_job(&self, job_id: &Uuid) -> Result<()> {
        let outbox = {
            let mut state = self.state.write().await;
            let mut outbox = Outbox::default();

            {
                let job = state
                    .jobs
                    .get_mut(job_id)
                    .ok_or(JobError::NotFound { id: *job_id })?;
                let status = job.status;
                if job.transition_to(JobStatus::Processing).is_err() {
                    return Err(JobError::InvalidState {
                        id: *job_id,
                        state: status.to_string(),
                        operation: "resume".to_string(),
                    }
                    .into());
                }
            }
            state.note_job_update(job_id, &mut outbox);

            let task_ids = state
                .jobs
                .get(job_id)
                .map(|job| job.task_ids.clone())
                .unwrap_or_default();

            let mut doomed_roots = Vec::new();
            for task_id in task_ids {
                let status = match state.tasks.get(&task_id) {
                    Some(task) => task.status,
                    None => continue,
                };
                match status {
                    TaskStatus::Paused => {
                        if state.running.contains_key(&task_id) {
                            // The attempt never stopped; just un-pause.
                            let recovered = state
                                .tasks
                                .get_mut(&task_id)
                                .map(|t| t.transition_to(TaskStatus::Processing).is_ok())
                                .unwrap_or(false);
                            if recovered {
                                state.note_task_update(&task_id, &mut outbox);
                            }
                        } else {
                            state.enqueue_task(&task_id, &mut outbox);
                        }
                    }
                    TaskStatus::Pending => {
                        let verdict = {
                            let Some(task) = state.tasks.get(&task_id) else {
                                continue;
                            };
                            state.deps_state(task)
                        };
                        match verdict {
                            DepsState::Satisfied => state.enqueue_task(&task_id, &mut outbox),
                            DepsState::Waiting => {}
                            DepsState::Doomed(dep_id) => {
                                if state.fail_unsatisfiable(&task_id, &dep_id, &mut outbox) {
                                    doomed_roots.push(task_id);
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }

            let mut failed = doomed_roots.len();
            for root in doomed_roots {
                failed += state.on_terminal_failure(&root, &mut outbox).len();
            }
            for _ in 0..failed {
                self.stats.record_task_failed();
            }

            state.check_job_completion(job_id, &mut outbox);
            outbox
        };
        self.deliver(outbox).await;
        self.queue_wake.notify_one();

        info!("Resumed job {}", job_id);
        Ok(())
    }

    /// Cancel a job: every non-terminal task is marked Cancelled, in-flight
    /// attempts are flagged for cooperative cancellation, and their results
    /// are discarded when they settle.
    pub async fn cancel_job(&self, job_id: &Uuid) -> Result<()> {
        let (cancelled, outbox) = {
            let mut state = self.state.write().await;
            let mut outbox = Outbox::default();

            {
                let job = state
                    .jobs
                    .get_mut(job_id)
                    .ok_or(JobError::NotFound { id: *job_id })?;
                let status = job.status;
                if job.transition_to(JobStatus::Cancelled).is_err() {
                    return Err(JobError::InvalidState {
                        id: *job_id,
                        state: status.to_string(),
                        operation: "cancel".to_string(),
                    }
                    .into());
                }
            }

            let task_ids = state
                .jobs
                .get(job_id)
                .map(|job| job.task_ids.clone())
                .unwrap_or_default();

            // Cancel every non-terminal task before any dependency fan-out,
            // so a pending task is never failed by a sibling it depends on.
            let mut cancelled_ids = Vec::new();
            for task_id in task_ids {
                let did_cancel = {
                    let Some(task) = state.tasks.get_mut(&task_id) else {
                        continue;
                    };
                    if task.status.is_terminal() {
                        continue;
                    }
                    task.transition_to(TaskStatus::Cancelled).is_ok()
                };
                if !did_cancel {
                    continue;
                }
                if let Some(running) = state.running.get(&task_id) {
                    running.cancelled.store(true, Ordering::Relaxed);
                }
                state.note_task_update(&task_id, &mut outbox);
                cancelled_ids.push(task_id);
            }

            // Tasks elsewhere that depend on a cancelled task can never run
            // now. Everything in this job is already terminal, so only
            // cross-job dependents are failed.
            let cancelled = cancelled_ids.len();
            for task_id in &cancelled_ids {
                let doomed = state.on_terminal_failure(task_id, &mut outbox);
                for _ in &doomed {
                    self.stats.record_task_failed();
                }
            }

            state.note_job_update(job_id, &mut outbox);
            self.stats.record_job_cancelled();
            self.stats.record_tasks_cancelled(cancelled);
            (cancelled, outbox)
        };
        self.deliver(outbox).await;

        info!(job_id = %job_id, cancelled, "Job cancelled");
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// Full status view of one job.
    pub async fn get_job_status(&self, job_id: &Uuid) -> Result<JobStatusSnapshot> {
        let state = self.state.read().await;
        let job = state
            .jobs
            .get(job_id)
            .ok_or(JobError::NotFound { id: *job_id })?;
        let tasks = state.task_counts(job);
        let progress = state.job_progress(job);
        Ok(JobStatusSnapshot {
            id: job.id,
            name: job.name.clone(),
            status: job.status,
            progress,
            tasks,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        })
    }

    /// Status view of one task.
    pub async fn get_task_status(&self, task_id: &str) -> Result<TaskSnapshot> {
        let state = self.state.read().await;
        state
            .tasks
            .get(task_id)
            .map(|task| task.snapshot())
            .ok_or_else(|| {
                TaskError::NotFound {
                    id: task_id.to_string(),
                }
                .into()
            })
    }

    /// List jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> Vec<JobSummary> {
        let state = self.state.read().await;
        let mut jobs: Vec<JobSummary> = state
            .jobs
            .values()
            .filter(|job| status.is_none_or(|s| job.status == s))
            .map(|job| state.job_summary(job))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Engine-wide statistics.
    pub async fn get_system_stats(&self) -> EngineStats {
        let state = self.state.read().await;
        let mut active = 0;
        let mut queued = 0;
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Processing => active += 1,
                TaskStatus::Queued => queued += 1,
                _ => {}
            }
        }
        self.stats.snapshot(active, queued)
    }

    /// Remove terminal jobs (and their tasks) that finished more than
    /// `older_than` ago. Returns how many jobs were removed.
    pub async fn cleanup_old_jobs(&self, older_than: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - age;

        let mut state = self.state.write().await;
        let to_remove: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .filter(|job| job.completed_at.is_some_and(|t| t <= cutoff))
            .map(|job| job.id)
            .collect();
        for job_id in &to_remove {
            state.remove_job(job_id);
        }
        if !to_remove.is_empty() {
            info!(removed = to_remove.len(), "Cleaned up old jobs");
        }
        to_remove.len()
    }
}

/// Find a cycle among sibling dependency references, returning the index of
/// a task inside one.
fn find_sibling_cycle(tasks: &[TaskSpec]) -> Option<usize> {
    // 0 = unvisited, 1 = on the current path, 2 = fully explored
    fn visit(index: usize, tasks: &[TaskSpec], marks: &mut [u8]) -> bool {
        match marks[index] {
            1 => return true,
            2 => return false,
            _ => {}
        }
        marks[index] = 1;
        for dep in &tasks[index].depends_on {
            if let TaskRef::Sibling(i) = dep {
                if *i < tasks.len() && visit(*i, tasks, marks) {
                    return true;
                }
            }
        }
        marks[index] = 2;
        false
    }

    let mut marks = vec![0u8; tasks.len()];
    (0..tasks.len()).find(|&index| marks[index] == 0 && visit(index, tasks, &mut marks))
}
