//! Error types.
//!
//! `TaskError` is what a caller of [`WorkerPool::run`](crate::WorkerPool::run)
//! sees. Its `Display` strings are short and stable; callers may match on them.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task exceeded the configured timeout. The context may still be running it.
    #[error("Worker timeout")]
    Timeout,

    /// The context ran the task and reported an application-level failure.
    #[error("{0}")]
    Task(String),

    /// The context itself failed while the task was assigned to it.
    #[error("error")]
    Crashed,

    /// No context could be created for the task.
    #[error("failed to start execution context: {0}")]
    Spawn(String),

    #[error("Pool is shutting down")]
    ShuttingDown,
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crashed)
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("context is closed")]
    Closed,
    #[error("failed to send to context: {0}")]
    Send(String),
}
