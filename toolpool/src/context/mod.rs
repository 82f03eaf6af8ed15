//! Execution contexts: the isolated runtimes the pool hands tasks to.
//!
//! The pool never looks inside a context. It creates one through a
//! [`ContextSpawner`], hands it tasks through [`ExecutionContext::dispatch`],
//! and learns about results only through the [`EventSender`] the context was
//! given at spawn time.

pub mod memory;
pub mod process;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::protocol::{EntryId, TaskId};
use crate::error::{ContextError, SpawnError};

pub use process::{ProcessContext, ProcessSpawner};

/// Terminal outcome reported by a context.
///
/// `Success` and `Error` answer one dispatched task. `Crash` means the
/// context itself is gone, whether or not it had a task.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    Success {
        task_id: TaskId,
        data: serde_json::Value,
    },
    Error {
        task_id: TaskId,
        error: String,
    },
    Crash {
        reason: String,
    },
}

pub(crate) type EventTx = mpsc::UnboundedSender<(EntryId, ContextEvent)>;

/// Reporting handle given to a context, tagged with its entry id.
#[derive(Debug, Clone)]
pub struct EventSender {
    entry_id: EntryId,
    tx: EventTx,
}

impl EventSender {
    pub(crate) fn new(entry_id: EntryId, tx: EventTx) -> Self {
        Self { entry_id, tx }
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    /// Returns false once the pool is gone.
    pub fn send(&self, event: ContextEvent) -> bool {
        self.tx.send((self.entry_id, event)).is_ok()
    }

    pub fn success(&self, task_id: TaskId, data: serde_json::Value) -> bool {
        self.send(ContextEvent::Success { task_id, data })
    }

    pub fn error(&self, task_id: TaskId, error: impl Into<String>) -> bool {
        self.send(ContextEvent::Error {
            task_id,
            error: error.into(),
        })
    }

    pub fn crash(&self, reason: impl Into<String>) -> bool {
        self.send(ContextEvent::Crash {
            reason: reason.into(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub payload: serde_json::Value,
}

/// Settings handed to a spawner for one new context.
#[derive(Debug, Clone)]
pub struct ContextSpawnConfig {
    pub entry_id: EntryId,
    pub memory_limit_mb: u64,
    pub task_timeout: Duration,
    pub spawn_timeout: Duration,
    pub events: EventSender,
}

/// One isolated runtime, exclusively owned by a pool entry.
///
/// Implementations must not block: `dispatch` queues the task and returns,
/// results come back later through the context's [`EventSender`].
pub trait ExecutionContext: Send {
    fn dispatch(&mut self, task: TaskRequest) -> Result<(), ContextError>;

    /// Kill the context now. Events it emits afterwards are ignored.
    fn terminate(&mut self);

    /// Ask the context to stop cleanly, escalating to a kill if it does not.
    fn shutdown(&mut self) {
        self.terminate();
    }
}

/// Extension point for different context runtimes (subprocess, thread, ...).
pub trait ContextSpawner: Send + Sync + 'static {
    fn spawn(&self, config: ContextSpawnConfig) -> Result<Box<dyn ExecutionContext>, SpawnError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_sender_tags_entry_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(EntryId::from(42), tx);
        let task_id = TaskId::new();

        assert!(sender.success(task_id, serde_json::json!(1)));
        assert!(sender.crash("segfault"));

        let (entry, event) = rx.try_recv().unwrap();
        assert_eq!(entry, EntryId::from(42));
        assert_eq!(
            event,
            ContextEvent::Success {
                task_id,
                data: serde_json::json!(1)
            }
        );

        let (_, event) = rx.try_recv().unwrap();
        assert!(matches!(event, ContextEvent::Crash { reason } if reason == "segfault"));
    }

    #[test]
    fn event_sender_reports_closed_pool() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = EventSender::new(EntryId::from(1), tx);
        drop(rx);
        assert!(!sender.error(TaskId::new(), "late"));
    }
}
