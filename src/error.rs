//! Error types for the task engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {state}, cannot {operation}")]
    InvalidState {
        id: Uuid,
        state: String,
        operation: String,
    },

    #[error("Job {name:?} has no tasks")]
    EmptyTaskList { name: String },

    #[error("Task {index} depends on sibling {dependency}, but the job only has {count} tasks")]
    DependencyOutOfRange {
        index: usize,
        dependency: usize,
        count: usize,
    },

    #[error("Task {index} depends on itself")]
    SelfDependency { index: usize },

    #[error("Task {index} is part of a dependency cycle")]
    DependencyCycle { index: usize },

    #[error("Task {index} depends on unknown task {id}")]
    UnknownDependency { index: usize, id: String },
}

/// Task-related errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
