//! Processor registry for dynamic task dispatch.
//!
//! Collaborators implement [`TaskProcessor`] for each task type they own and
//! register it under that type. The dispatcher looks processors up by the
//! task's `task_type` at execution time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::task::TaskId;

/// Execution context handed to a processor for a single attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub job_id: Uuid,
    /// 1 for the first attempt, incremented on each retry.
    pub attempt: u32,
    cancelled: Arc<AtomicBool>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        job_id: Uuid,
        attempt: u32,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id,
            job_id,
            attempt,
            cancelled,
        }
    }

    /// Whether the owning job was cancelled while this attempt is running.
    ///
    /// Long-running processors should check this at convenient points and
    /// return early; the engine never force-kills an attempt on cancel.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A capability that executes one type of task.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Run one attempt. The returned value becomes the task's result;
    /// an error marks the attempt failed and may trigger a retry.
    async fn process(&self, payload: Value, ctx: &TaskContext) -> anyhow::Result<Value>;
}

/// Registry of task processors, keyed by task type.
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn TaskProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(HashMap::new()),
        }
    }

    /// Register a processor for a task type, replacing any existing one.
    pub async fn register(&self, task_type: impl Into<String>, processor: Arc<dyn TaskProcessor>) {
        let task_type = task_type.into();
        let mut processors = self.processors.write().await;
        if processors.insert(task_type.clone(), processor).is_some() {
            tracing::warn!("Processor for {} was replaced in registry", task_type);
        }
    }

    /// Get a processor by task type.
    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskProcessor>> {
        self.processors.read().await.get(task_type).cloned()
    }

    /// Check whether a task type has a processor.
    pub async fn has(&self, task_type: &str) -> bool {
        self.processors.read().await.contains_key(task_type)
    }

    /// List registered task types.
    pub async fn list(&self) -> Vec<String> {
        self.processors.read().await.keys().cloned().collect()
    }

    /// Number of registered processors.
    pub async fn count(&self) -> usize {
        self.processors.read().await.len()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
