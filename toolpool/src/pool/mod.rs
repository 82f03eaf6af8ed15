//! Bounded pool of execution contexts.
//!
//! [`WorkerPool`] is a cheap, cloneable handle. All bookkeeping lives in a
//! dispatcher task that owns the entries and the wait queue; the handle only
//! sends it commands.
//!
//! ```text
//! run() ──Command──▶ dispatcher ──dispatch──▶ context
//!   ▲                    │  ▲                    │
//!   └──── oneshot ───────┘  └──── ContextEvent ──┘
//! ```
//!
//! At most `max_concurrency` contexts exist at once. A task that finds no
//! idle entry and no room for a new one waits in FIFO order.

mod dispatcher;
pub mod entry;
pub mod queue;

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::PoolConfig;
use crate::context::ContextSpawner;
use crate::error::TaskError;
use dispatcher::{Command, Dispatcher};

pub use entry::{EntrySnapshot, EntryStatus};

/// Point-in-time pool counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub max_concurrency: usize,
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub queued: usize,
    /// Contexts created over the pool's lifetime.
    pub spawned: u64,
    pub entries: Vec<EntrySnapshot>,
}

#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    max_concurrency: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_concurrency", &self.max_concurrency)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl WorkerPool {
    /// Start a pool. Must be called inside a tokio runtime.
    pub fn new(mut config: PoolConfig, spawner: Arc<dyn ContextSpawner>) -> Self {
        config.max_concurrency = config.max_concurrency.max(1);
        let max_concurrency = config.max_concurrency;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(Dispatcher::new(config, spawner).run(commands_rx));
        Self {
            commands,
            max_concurrency,
        }
    }

    /// Submit a task.
    ///
    /// The task is handed to the pool when `run` is called, not when the
    /// returned future is first polled, so submission order is call order.
    /// Dropping the future abandons the result; a task still waiting in the
    /// queue is then never dispatched.
    pub fn run(
        &self,
        payload: serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static {
        let (completion, result) = oneshot::channel();
        let submitted = self
            .commands
            .send(Command::Run {
                payload,
                completion,
            })
            .is_ok();

        async move {
            if !submitted {
                return Err(TaskError::ShuttingDown);
            }
            // The dispatcher only drops a completion unsent when it is exiting.
            result.await.unwrap_or(Err(TaskError::ShuttingDown))
        }
    }

    /// None once the pool has shut down.
    pub async fn stats(&self) -> Option<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Stats { reply }).ok()?;
        rx.await.ok()
    }

    /// Reject everything queued or running, stop every context, stop the
    /// dispatcher. Safe to call more than once.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.commands.is_closed()
    }
}
