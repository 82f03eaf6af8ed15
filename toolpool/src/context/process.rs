//! Subprocess execution context.
//!
//! Each context is one child process speaking the framed JSON protocol over
//! its stdin/stdout. Three background tasks serve it:
//!
//! - writer: owns stdin, writes queued [`ContextRequest`]s
//! - stderr: keeps the last lines of stderr for crash diagnostics
//! - supervisor: owns the child and stdout, forwards replies as
//!   [`ContextEvent`](super::ContextEvent)s, enforces the ready deadline and
//!   the memory limit, and reports exactly one crash if the child dies
//!
//! The child gets a clean environment: only `PATH` plus whatever the spawner
//! was configured with.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use super::memory::{self, MEMORY_POLL_INTERVAL};
use super::{ContextSpawnConfig, ContextSpawner, EventSender, ExecutionContext, TaskRequest};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ContextRequest, ContextResponse, EntryId};
use crate::error::{ContextError, SpawnError};

const STDERR_TAIL_LINES: usize = 20;

/// Time a closing child gets to report its exit status.
const EXIT_WAIT: Duration = Duration::from_secs(1);

/// Time a child gets to exit on its own after a `Shutdown` request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Time between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(1);

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Spawns one child process per context.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pass an extra variable through the otherwise cleared environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl ContextSpawner for ProcessSpawner {
    fn spawn(&self, config: ContextSpawnConfig) -> Result<Box<dyn ExecutionContext>, SpawnError> {
        let entry_id = config.entry_id;
        let path = std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string());

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .env("PATH", path)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError::Other("child stderr not captured".to_string()))?;
        let pid = child.id();

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (write_failed_tx, write_failed_rx) = oneshot::channel();
        let (terminate_tx, terminate_rx) = oneshot::channel();

        // Queued before the writer starts, so it is always the first frame.
        let _ = request_tx.send(ContextRequest::Init {
            entry_id,
            memory_limit_mb: config.memory_limit_mb,
            task_timeout_ms: config.task_timeout.as_millis() as u64,
        });

        let tail = StderrTail::default();
        tokio::spawn(write_requests(stdin, request_rx, write_failed_tx));
        tokio::spawn(collect_stderr(stderr, tail.clone(), entry_id));
        tokio::spawn(supervise(Supervision {
            child,
            reader: FramedRead::new(stdout, JsonCodec::new()),
            terminate_rx,
            write_failed_rx,
            events: config.events,
            tail,
            memory_limit_mb: config.memory_limit_mb,
            spawn_timeout: config.spawn_timeout,
        }));

        info!(
            entry = %entry_id,
            pid = ?pid,
            program = %self.program.display(),
            "Spawned execution context"
        );

        Ok(Box::new(ProcessContext {
            entry_id,
            pid,
            requests: request_tx,
            terminate: Some(terminate_tx),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Graceful,
    Kill,
}

/// Handle to a running child process.
///
/// Dropping it kills the child.
pub struct ProcessContext {
    entry_id: EntryId,
    pid: Option<u32>,
    requests: mpsc::UnboundedSender<ContextRequest>,
    terminate: Option<oneshot::Sender<Termination>>,
}

impl ProcessContext {
    fn signal(&mut self, termination: Termination) {
        if let Some(tx) = self.terminate.take() {
            // Err means the supervisor already finished with the child.
            let _ = tx.send(termination);
        }
    }
}

impl ExecutionContext for ProcessContext {
    fn dispatch(&mut self, task: TaskRequest) -> Result<(), ContextError> {
        if self.terminate.is_none() {
            return Err(ContextError::Closed);
        }
        trace!(entry = %self.entry_id, task_id = %task.task_id, "Dispatching task");
        self.requests
            .send(ContextRequest::Task {
                task_id: task.task_id,
                payload: task.payload,
            })
            .map_err(|_| ContextError::Closed)
    }

    fn terminate(&mut self) {
        debug!(entry = %self.entry_id, pid = ?self.pid, "Terminating context");
        self.signal(Termination::Kill);
    }

    fn shutdown(&mut self) {
        debug!(entry = %self.entry_id, pid = ?self.pid, "Shutting down context");
        let _ = self.requests.send(ContextRequest::Shutdown);
        self.signal(Termination::Graceful);
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.signal(Termination::Kill);
    }
}

/// Last lines a child wrote to stderr.
#[derive(Debug, Clone, Default)]
struct StderrTail {
    lines: Arc<StdMutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == STDERR_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn joined(&self) -> String {
        match self.lines.lock() {
            Ok(lines) => lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }
}

async fn write_requests(
    stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<ContextRequest>,
    write_failed: oneshot::Sender<String>,
) {
    let mut writer = FramedWrite::new(stdin, JsonCodec::<ContextRequest>::new());
    while let Some(request) = requests.recv().await {
        let is_shutdown = matches!(request, ContextRequest::Shutdown);
        if let Err(e) = writer.send(request).await {
            if !is_shutdown {
                let _ = write_failed.send(format!("failed to write to context: {e}"));
            }
            return;
        }
        if is_shutdown {
            // Dropping stdin gives the child EOF as well.
            return;
        }
    }
}

async fn collect_stderr(stderr: ChildStderr, tail: StderrTail, entry: EntryId) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "toolpool::context::stderr", entry = %entry, "{}", line);
        tail.push(line);
    }
}

struct Supervision {
    child: Child,
    reader: FramedRead<ChildStdout, JsonCodec<ContextResponse>>,
    terminate_rx: oneshot::Receiver<Termination>,
    write_failed_rx: oneshot::Receiver<String>,
    events: EventSender,
    tail: StderrTail,
    memory_limit_mb: u64,
    spawn_timeout: Duration,
}

async fn supervise(s: Supervision) {
    let Supervision {
        mut child,
        mut reader,
        mut terminate_rx,
        mut write_failed_rx,
        events,
        tail,
        memory_limit_mb,
        spawn_timeout,
    } = s;

    let entry = events.entry_id();
    let pid = child.id();
    let mut ready = false;
    let mut writer_done = false;

    let ready_deadline = tokio::time::sleep(spawn_timeout);
    tokio::pin!(ready_deadline);

    let mut memory_tick = tokio::time::interval(MEMORY_POLL_INTERVAL);
    memory_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;

            termination = &mut terminate_rx => {
                // A dropped handle means nobody will ever stop us gracefully.
                let termination = termination.unwrap_or(Termination::Kill);
                stop_child(&mut child, termination, entry).await;
                return;
            }

            failed = &mut write_failed_rx, if !writer_done => {
                writer_done = true;
                if let Ok(reason) = failed {
                    break reason;
                }
            }

            msg = reader.next() => match msg {
                Some(Ok(response)) => {
                    if let Some(reason) = handshake_violation(ready, entry, &response) {
                        break reason;
                    }
                    match response {
                        ContextResponse::Ready { .. } => {
                            ready = true;
                            debug!(%entry, pid = ?pid, "Context ready");
                        }
                        ContextResponse::Success { task_id, data } => {
                            events.success(task_id, data);
                        }
                        ContextResponse::Error { task_id, error } => {
                            events.error(task_id, error);
                        }
                    }
                }
                Some(Err(e)) => break format!("invalid frame from context: {e}"),
                None => break exit_reason(&mut child).await,
            },

            _ = &mut ready_deadline, if !ready => {
                break format!("context not ready after {}ms", spawn_timeout.as_millis());
            }

            _ = memory_tick.tick(), if memory_limit_mb > 0 => {
                if let Some(pid) = pid {
                    let rss = memory::rss_kib(pid);
                    if memory::exceeds_limit(rss, memory_limit_mb) {
                        break format!(
                            "memory limit exceeded ({} KiB > {} MiB)",
                            rss.unwrap_or_default(),
                            memory_limit_mb
                        );
                    }
                }
            }
        }
    };

    if let Err(e) = child.start_kill() {
        trace!(%entry, error = %e, "Kill after crash failed, child already gone");
    }
    let _ = child.wait().await;

    let stderr = tail.joined();
    if stderr.is_empty() {
        warn!(%entry, %reason, "Context crashed");
    } else {
        warn!(%entry, %reason, %stderr, "Context crashed");
    }
    events.crash(reason);
}

/// Crash reason for a reply that breaks the `Ready`-first handshake.
fn handshake_violation(ready: bool, entry: EntryId, response: &ContextResponse) -> Option<String> {
    match response {
        ContextResponse::Ready { .. } if ready => Some("context sent a second ready".to_string()),
        ContextResponse::Ready { entry_id } if *entry_id != entry => Some(format!(
            "context reported entry {entry_id}, expected {entry}"
        )),
        ContextResponse::Ready { .. } => None,
        _ if !ready => Some(match response.task_id() {
            Some(task_id) => format!("context replied for task {task_id} before ready"),
            None => "context replied before ready".to_string(),
        }),
        _ => None,
    }
}

async fn exit_reason(child: &mut Child) -> String {
    match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
        Ok(Ok(status)) => format!("context exited ({status})"),
        Ok(Err(e)) => format!("context closed its output, wait failed: {e}"),
        Err(_) => "context closed its output".to_string(),
    }
}

async fn stop_child(child: &mut Child, termination: Termination, entry: EntryId) {
    if termination == Termination::Graceful {
        if let Ok(status) = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            debug!(%entry, ?status, "Context exited");
            return;
        }
        #[cfg(unix)]
        send_sigterm(child.id(), entry);
        if let Ok(status) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
            debug!(%entry, ?status, "Context exited after SIGTERM");
            return;
        }
        warn!(%entry, "Context ignored shutdown, killing");
    }

    if let Err(e) = child.start_kill() {
        trace!(%entry, error = %e, "Kill failed, child already gone");
    }
    let _ = child.wait().await;
    debug!(%entry, "Context killed");
}

#[cfg(unix)]
fn send_sigterm(pid: Option<u32>, entry: EntryId) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(%entry, pid, error = %e, "SIGTERM failed");
    }
}
