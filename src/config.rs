//! Configuration types.

use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of tasks processing at once, across all jobs.
    pub max_workers: usize,
    /// Per-attempt timeout applied to tasks that do not set their own.
    pub default_task_timeout: Duration,
    /// Retry budget for tasks that do not set their own.
    pub default_max_retries: u32,
    /// Per-job concurrency limit applied when a job does not set its own.
    pub default_concurrency_limit: usize,
    /// Base delay before the first retry; doubles on each subsequent retry.
    pub retry_backoff: Duration,
    /// Upper bound on the retry delay.
    pub retry_backoff_cap: Duration,
    /// How long the dispatcher sleeps when the queue has no dispatchable task.
    pub poll_interval: Duration,
    /// Capacity of the engine event broadcast channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            default_task_timeout: Duration::from_secs(300), // 5 minutes
            default_max_retries: 3,
            default_concurrency_limit: 3,
            retry_backoff: Duration::from_millis(500),
            retry_backoff_cap: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            event_capacity: 256,
        }
    }
}
