//! FIFO wait queue for tasks that arrived while the pool was saturated.

use std::collections::VecDeque;
use std::time::Instant;

use super::entry::Completion;
use crate::error::TaskError;

/// A task waiting for capacity.
#[derive(Debug)]
pub struct PendingTask {
    pub payload: serde_json::Value,
    completion: Completion,
    enqueued_at: Instant,
}

impl PendingTask {
    pub fn new(payload: serde_json::Value, completion: Completion) -> Self {
        Self {
            payload,
            completion,
            enqueued_at: Instant::now(),
        }
    }

    /// The caller dropped its future; nobody is waiting for a result.
    pub fn is_abandoned(&self) -> bool {
        self.completion.is_closed()
    }

    pub fn waited(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }

    pub fn reject(self, err: TaskError) {
        let _ = self.completion.send(Err(err));
    }

    pub fn into_parts(self) -> (serde_json::Value, Completion) {
        (self.payload, self.completion)
    }
}

#[derive(Debug, Default)]
pub struct WaitQueue {
    tasks: VecDeque<PendingTask>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, task: PendingTask) {
        self.tasks.push_back(task);
    }

    /// Return a task to the head, keeping its place in line.
    pub fn push_front(&mut self, task: PendingTask) {
        self.tasks.push_front(task);
    }

    /// Oldest task whose caller is still waiting. Abandoned ones are dropped.
    pub fn pop_next(&mut self) -> Option<PendingTask> {
        while let Some(task) = self.tasks.pop_front() {
            if task.is_abandoned() {
                tracing::debug!("Skipping abandoned queued task");
                continue;
            }
            return Some(task);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop abandoned tasks so they stop counting as queued.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|t| !t.is_abandoned());
        before - self.tasks.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingTask> + '_ {
        self.tasks.drain(..)
    }
}
