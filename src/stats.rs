//! Engine-wide throughput counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Point-in-time engine statistics, as returned by `get_system_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Tasks currently processing.
    pub active_tasks: usize,
    /// Tasks waiting in the dispatch queue.
    pub queued_tasks: usize,
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_cancelled: u64,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    /// Terminal failures. Transient failures show up in `tasks_retried`.
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_retried: u64,
    /// Mean attempt duration across settled attempts.
    pub average_task_duration_ms: f64,
    /// Completed over completed-plus-failed; 1.0 before any task settles.
    pub success_rate: f64,
    pub uptime_secs: u64,
}

/// Lock-free counters updated from the dispatch path.
pub(crate) struct StatsRecorder {
    started: Instant,
    jobs_created: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_cancelled: AtomicU64,
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    tasks_retried: AtomicU64,
    attempts_settled: AtomicU64,
    attempt_time_ms: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            jobs_created: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            attempts_settled: AtomicU64::new(0),
            attempt_time_ms: AtomicU64::new(0),
        }
    }

    pub fn record_job_created(&self, task_count: usize) {
        self.jobs_created.fetch_add(1, Ordering::Relaxed);
        self.tasks_submitted
            .fetch_add(task_count as u64, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tasks_cancelled(&self, count: usize) {
        self.tasks_cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt(&self, duration: Duration) {
        self.attempts_settled.fetch_add(1, Ordering::Relaxed);
        self.attempt_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_tasks: usize, queued_tasks: usize) -> EngineStats {
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        let failed = self.tasks_failed.load(Ordering::Relaxed);
        let attempts = self.attempts_settled.load(Ordering::Relaxed);
        let attempt_time_ms = self.attempt_time_ms.load(Ordering::Relaxed);

        let average_task_duration_ms = if attempts > 0 {
            attempt_time_ms as f64 / attempts as f64
        } else {
            0.0
        };
        let success_rate = if completed + failed > 0 {
            completed as f64 / (completed + failed) as f64
        } else {
            1.0
        };

        EngineStats {
            active_tasks,
            queued_tasks,
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            average_task_duration_ms,
            success_rate,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}
