//! Pool entries: one execution context plus the task it is running.
//!
//! An entry is running exactly when it holds an [`ActiveTask`]. The task keeps
//! the caller's completion until a result, a timeout or a crash takes it, so a
//! caller is resolved at most once by construction.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{EntryId, TaskId};
use crate::context::ExecutionContext;
use crate::error::TaskError;

/// Where a task's result goes.
pub type Completion = oneshot::Sender<Result<serde_json::Value, TaskError>>;

/// A task's timeout elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub entry: EntryId,
    pub task_id: TaskId,
}

pub(crate) type TimerTx = mpsc::UnboundedSender<TimerFired>;

/// Armed timeout for one dispatch. Dropping it disarms the timer.
#[derive(Debug)]
pub struct TimeoutHandle(JoinHandle<()>);

impl TimeoutHandle {
    pub(crate) fn arm(after: Duration, fired: TimerFired, tx: TimerTx) -> Self {
        Self(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(fired);
        }))
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
pub struct ActiveTask {
    task_id: TaskId,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    /// None once the caller was rejected by the timeout.
    completion: Option<Completion>,
    timeout: Option<TimeoutHandle>,
}

impl ActiveTask {
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn timed_out(&self) -> bool {
        self.completion.is_none()
    }
}

/// Outcome of matching a reply against an entry's current task.
#[derive(Debug)]
pub enum Finish {
    /// The caller is still waiting.
    Deliver(Completion, Duration),
    /// The task already timed out; the reply has nobody to go to.
    Late(Duration),
    /// The reply does not belong to the current task.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Idle,
    Running,
}

/// Point-in-time view of an entry, for stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub status: EntryStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub tasks_completed: u64,
    pub timed_out: bool,
}

pub struct PoolEntry {
    id: EntryId,
    context: Box<dyn ExecutionContext>,
    task: Option<ActiveTask>,
    tasks_completed: u64,
}

impl std::fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("tasks_completed", &self.tasks_completed)
            .finish_non_exhaustive()
    }
}

impl PoolEntry {
    pub fn new(id: EntryId, context: Box<dyn ExecutionContext>) -> Self {
        Self {
            id,
            context,
            task: None,
            tasks_completed: 0,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn is_idle(&self) -> bool {
        self.task.is_none()
    }

    pub fn context_mut(&mut self) -> &mut dyn ExecutionContext {
        self.context.as_mut()
    }

    /// Mark the entry running. Panics in debug builds if it already is.
    pub fn assign(&mut self, task_id: TaskId, completion: Completion, timeout: Option<TimeoutHandle>) {
        debug_assert!(self.task.is_none(), "entry {} assigned twice", self.id);
        self.task = Some(ActiveTask {
            task_id,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            completion: Some(completion),
            timeout,
        });
    }

    /// Take the caller's completion for a timeout, leaving the entry running.
    ///
    /// None if `task_id` is no longer current or was already resolved.
    pub fn take_completion(&mut self, task_id: TaskId) -> Option<Completion> {
        let task = self.task.as_mut().filter(|t| t.task_id == task_id)?;
        task.timeout = None;
        task.completion.take()
    }

    /// Clear the current task in response to a reply for `task_id`.
    pub fn finish(&mut self, task_id: TaskId) -> Finish {
        if self.task.as_ref().map(|t| t.task_id) != Some(task_id) {
            return Finish::Stale;
        }
        let Some(task) = self.task.take() else {
            return Finish::Stale;
        };
        self.tasks_completed += 1;
        let elapsed = task.elapsed();
        match task.completion {
            Some(completion) => Finish::Deliver(completion, elapsed),
            None => Finish::Late(elapsed),
        }
    }

    /// Reject the in-flight caller, if any. Returns whether one was waiting.
    pub fn fail_in_flight(&mut self, err: TaskError) -> bool {
        match self.task.take().and_then(|t| t.completion) {
            Some(completion) => {
                let _ = completion.send(Err(err));
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id,
            status: if self.is_idle() {
                EntryStatus::Idle
            } else {
                EntryStatus::Running
            },
            started_at: self.task.as_ref().map(|t| t.started_wall),
            tasks_completed: self.tasks_completed,
            timed_out: self.task.as_ref().is_some_and(ActiveTask::timed_out),
        }
    }
}
