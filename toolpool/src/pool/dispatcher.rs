//! The pool's event loop.
//!
//! A single task owns every entry and the wait queue. It reacts to three
//! inputs, in priority order: context events, timeout firings, caller
//! commands. Handling context events first means a result that is already
//! waiting frees its entry before a new command looks for capacity.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use super::entry::{Completion, Finish, PoolEntry, TimeoutHandle, TimerFired};
use super::queue::{PendingTask, WaitQueue};
use super::PoolStats;
use crate::bridge::protocol::{EntryId, TaskId};
use crate::config::{PoolConfig, TimeoutPolicy};
use crate::context::{ContextEvent, ContextSpawnConfig, ContextSpawner, EventSender, TaskRequest};
use crate::error::{SpawnError, TaskError};

pub(crate) enum Command {
    Run {
        payload: serde_json::Value,
        completion: Completion,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum Slot {
    Ready(EntryId),
    Saturated,
    SpawnFailed(SpawnError),
}

pub(crate) struct Dispatcher {
    config: PoolConfig,
    spawner: Arc<dyn ContextSpawner>,
    entries: BTreeMap<EntryId, PoolEntry>,
    queue: WaitQueue,
    events_tx: mpsc::UnboundedSender<(EntryId, ContextEvent)>,
    events_rx: mpsc::UnboundedReceiver<(EntryId, ContextEvent)>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    spawned: u64,
}

impl Dispatcher {
    pub(crate) fn new(config: PoolConfig, spawner: Arc<dyn ContextSpawner>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Self {
            config,
            spawner,
            entries: BTreeMap::new(),
            queue: WaitQueue::new(),
            events_tx,
            events_rx,
            timer_tx,
            timer_rx,
            spawned: 0,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::info!(
            max_concurrency = self.config.max_concurrency,
            task_timeout_ms = self.config.task_timeout.as_millis() as u64,
            timeout_policy = ?self.config.timeout_policy,
            "Worker pool started"
        );

        loop {
            tokio::select! {
                biased;

                // Both senders live in `self`, so these never yield None.
                Some((entry, event)) = self.events_rx.recv() => {
                    self.on_event(entry, event);
                }

                Some(fired) = self.timer_rx.recv() => {
                    self.on_timeout(fired);
                }

                cmd = commands.recv() => match cmd {
                    Some(Command::Run { payload, completion }) => {
                        self.admit(payload, completion);
                    }
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        tracing::debug!("All pool handles dropped");
                        self.shutdown();
                        break;
                    }
                },
            }
        }
    }

    fn admit(&mut self, payload: serde_json::Value, completion: Completion) {
        if completion.is_closed() {
            tracing::debug!("Caller gone before admission, dropping task");
            return;
        }
        if !self.queue.is_empty() {
            let pruned = self.queue.prune_abandoned();
            if pruned > 0 {
                tracing::trace!(pruned, "Dropped abandoned queued tasks");
            }
        }
        // Always through the queue: a new task never overtakes one that waited.
        self.queue.push_back(PendingTask::new(payload, completion));
        self.drain_queue();
    }

    /// Hand queued tasks to entries while capacity exists.
    ///
    /// A failed spawn rejects the task only when no entry is alive to take it
    /// later; otherwise the task goes back to the head of the queue.
    fn drain_queue(&mut self) {
        while let Some(task) = self.queue.pop_next() {
            match self.acquire_slot() {
                Slot::Ready(id) => self.dispatch(id, task),
                Slot::Saturated => {
                    self.queue.push_front(task);
                    tracing::trace!(queued = self.queue.len(), "Pool saturated");
                    break;
                }
                Slot::SpawnFailed(e) if !self.entries.is_empty() => {
                    // Live entries will free up; wait for them instead.
                    self.queue.push_front(task);
                    tracing::debug!(error = %e, queued = self.queue.len(), "Spawn failed, waiting for a busy entry");
                    break;
                }
                Slot::SpawnFailed(e) => task.reject(TaskError::Spawn(e.to_string())),
            }
        }
    }

    fn acquire_slot(&mut self) -> Slot {
        if let Some(entry) = self.entries.values().find(|e| e.is_idle()) {
            return Slot::Ready(entry.id());
        }
        if self.entries.len() >= self.config.max_concurrency {
            return Slot::Saturated;
        }

        let id = EntryId::next();
        let spawn_config = ContextSpawnConfig {
            entry_id: id,
            memory_limit_mb: self.config.memory_limit_mb,
            task_timeout: self.config.task_timeout,
            spawn_timeout: self.config.spawn_timeout,
            events: EventSender::new(id, self.events_tx.clone()),
        };
        match self.spawner.spawn(spawn_config) {
            Ok(context) => {
                self.entries.insert(id, PoolEntry::new(id, context));
                self.spawned += 1;
                tracing::debug!(entry = %id, total = self.entries.len(), "Added pool entry");
                Slot::Ready(id)
            }
            Err(e) => {
                tracing::error!(entry = %id, error = %e, "Failed to spawn execution context");
                Slot::SpawnFailed(e)
            }
        }
    }

    fn dispatch(&mut self, id: EntryId, task: PendingTask) {
        let Some(entry) = self.entries.get_mut(&id) else {
            tracing::error!(entry = %id, "Selected entry vanished before dispatch");
            task.reject(TaskError::Crashed);
            return;
        };

        let waited_ms = task.waited().as_millis() as u64;
        let (payload, completion) = task.into_parts();
        let task_id = TaskId::new();
        let timeout = (!self.config.task_timeout.is_zero()).then(|| {
            TimeoutHandle::arm(
                self.config.task_timeout,
                TimerFired { entry: id, task_id },
                self.timer_tx.clone(),
            )
        });
        entry.assign(task_id, completion, timeout);

        let sent = entry.context_mut().dispatch(TaskRequest { task_id, payload });
        match sent {
            Ok(()) => {
                tracing::debug!(entry = %id, task = %task_id, waited_ms, "Task dispatched");
            }
            Err(e) => self.remove_crashed(id, &format!("dispatch failed: {e}")),
        }
    }

    fn on_event(&mut self, id: EntryId, event: ContextEvent) {
        if !self.entries.contains_key(&id) {
            tracing::warn!(entry = %id, ?event, "Event for unknown entry dropped");
            return;
        }
        match event {
            ContextEvent::Success { task_id, data } => self.on_reply(id, task_id, Ok(data)),
            ContextEvent::Error { task_id, error } => {
                self.on_reply(id, task_id, Err(TaskError::Task(error)))
            }
            ContextEvent::Crash { reason } => {
                self.remove_crashed(id, &reason);
                self.drain_queue();
            }
        }
    }

    fn on_reply(
        &mut self,
        id: EntryId,
        task_id: TaskId,
        result: Result<serde_json::Value, TaskError>,
    ) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        match entry.finish(task_id) {
            Finish::Deliver(completion, elapsed) => {
                tracing::debug!(
                    entry = %id,
                    task = %task_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    ok = result.is_ok(),
                    "Task completed"
                );
                if completion.send(result).is_err() {
                    tracing::debug!(entry = %id, task = %task_id, "Caller gone before result");
                }
            }
            Finish::Late(elapsed) => {
                tracing::debug!(
                    entry = %id,
                    task = %task_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Reply after timeout discarded"
                );
            }
            Finish::Stale => {
                tracing::warn!(entry = %id, task = %task_id, "Reply for a task not running on this entry dropped");
                return;
            }
        }
        self.drain_queue();
    }

    fn on_timeout(&mut self, fired: TimerFired) {
        let TimerFired { entry: id, task_id } = fired;
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Some(completion) = entry.take_completion(task_id) else {
            return;
        };
        let _ = completion.send(Err(TaskError::Timeout));
        tracing::warn!(
            entry = %id,
            task = %task_id,
            timeout_ms = self.config.task_timeout.as_millis() as u64,
            policy = ?self.config.timeout_policy,
            "Task timed out"
        );

        if self.config.timeout_policy == TimeoutPolicy::Terminate {
            if let Some(mut entry) = self.entries.remove(&id) {
                entry.context_mut().terminate();
            }
            self.drain_queue();
        }
    }

    /// Remove a dead entry, rejecting its caller. Does not drain the queue.
    fn remove_crashed(&mut self, id: EntryId, reason: &str) {
        let Some(mut entry) = self.entries.remove(&id) else {
            return;
        };
        let had_task = entry.fail_in_flight(TaskError::Crashed);
        tracing::warn!(entry = %id, %reason, had_task, "Execution context crashed, entry removed");
        entry.context_mut().terminate();
    }

    fn stats(&mut self) -> PoolStats {
        self.queue.prune_abandoned();
        let entries: Vec<_> = self.entries.values().map(PoolEntry::snapshot).collect();
        let idle = self.entries.values().filter(|e| e.is_idle()).count();
        PoolStats {
            max_concurrency: self.config.max_concurrency,
            total: entries.len(),
            idle,
            busy: entries.len() - idle,
            queued: self.queue.len(),
            spawned: self.spawned,
            entries,
        }
    }

    fn shutdown(&mut self) {
        let queued = self.queue.len();
        for task in self.queue.drain() {
            task.reject(TaskError::ShuttingDown);
        }

        let entries = std::mem::take(&mut self.entries);
        let total = entries.len();
        for (_, mut entry) in entries {
            entry.fail_in_flight(TaskError::ShuttingDown);
            entry.context_mut().shutdown();
        }

        tracing::info!(queued, entries = total, spawned = self.spawned, "Worker pool shut down");
    }
}
