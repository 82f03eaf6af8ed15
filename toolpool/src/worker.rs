//! Child side of the subprocess protocol.
//!
//! A worker binary implements [`TaskHandler`] and calls [`run_worker`]. The
//! runtime answers `init` with `ready`, then runs one task at a time and
//! writes exactly one reply per task until it sees `shutdown` or EOF.
//!
//! Logging must go to stderr; stdout is the protocol channel.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ContextRequest, ContextResponse, EntryId};

/// Settings the pool sent in `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInit {
    pub entry_id: EntryId,
    pub memory_limit_mb: u64,
    pub task_timeout: Duration,
}

#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Runs once before `ready` is sent. An error ends the worker.
    async fn init(&self, _init: &WorkerInit) -> Result<(), String> {
        Ok(())
    }

    /// `Err` is reported to the caller verbatim as a task error.
    async fn execute(&self, payload: serde_json::Value) -> Result<serde_json::Value, String>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("protocol I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected message before init: {0}")]
    Protocol(String),
    #[error("handler init failed: {0}")]
    Init(String),
}

/// Serve the protocol on this process's stdin/stdout.
pub async fn run_worker<H: TaskHandler>(handler: H) -> Result<(), WorkerError> {
    run_worker_on(Arc::new(handler), tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve the protocol on arbitrary streams.
pub async fn run_worker_on<H, R, W>(handler: Arc<H>, reader: R, writer: W) -> Result<(), WorkerError>
where
    H: TaskHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(reader, JsonCodec::<ContextRequest>::new());
    let mut writer = FramedWrite::new(writer, JsonCodec::<ContextResponse>::new());

    let init = match reader.next().await {
        Some(Ok(ContextRequest::Init {
            entry_id,
            memory_limit_mb,
            task_timeout_ms,
        })) => WorkerInit {
            entry_id,
            memory_limit_mb,
            task_timeout: Duration::from_millis(task_timeout_ms),
        },
        Some(Ok(other)) => return Err(WorkerError::Protocol(format!("{other:?}"))),
        Some(Err(e)) => return Err(e.into()),
        None => {
            tracing::debug!("Input closed before init");
            return Ok(());
        }
    };

    handler.init(&init).await.map_err(WorkerError::Init)?;
    writer
        .send(ContextResponse::Ready {
            entry_id: init.entry_id,
        })
        .await?;
    tracing::info!(entry = %init.entry_id, "Worker ready");

    while let Some(msg) = reader.next().await {
        match msg? {
            ContextRequest::Task { task_id, payload } => {
                tracing::debug!(task = %task_id, "Running task");
                let h = Arc::clone(&handler);
                let outcome = tokio::spawn(async move { h.execute(payload).await }).await;
                let reply = match outcome {
                    Ok(Ok(data)) => ContextResponse::Success { task_id, data },
                    Ok(Err(error)) => ContextResponse::Error { task_id, error },
                    Err(e) => {
                        let error = join_error_message(e);
                        tracing::error!(task = %task_id, %error, "Task handler failed");
                        ContextResponse::Error { task_id, error }
                    }
                };
                writer.send(reply).await?;
            }
            ContextRequest::Shutdown => {
                tracing::info!("Shutdown requested");
                break;
            }
            ContextRequest::Init { .. } => {
                tracing::warn!("Ignoring repeated init");
            }
        }
    }

    Ok(())
}

fn join_error_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            format!("task panicked: {msg}")
        }
        Err(err) => format!("task aborted: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::TaskId;
    use serde_json::{Value, json};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct TestHandler;

    #[async_trait::async_trait]
    impl TaskHandler for TestHandler {
        async fn execute(&self, payload: Value) -> Result<Value, String> {
            match payload["op"].as_str() {
                Some("echo") => Ok(payload["value"].clone()),
                Some("fail") => Err("ValueError: nope".to_string()),
                Some("panic") => panic!("boom"),
                _ => Err("unknown op".to_string()),
            }
        }
    }

    struct RefusingHandler;

    #[async_trait::async_trait]
    impl TaskHandler for RefusingHandler {
        async fn init(&self, _init: &WorkerInit) -> Result<(), String> {
            Err("missing runtime".to_string())
        }

        async fn execute(&self, _payload: Value) -> Result<Value, String> {
            unreachable!()
        }
    }

    type PoolSide = (
        FramedWrite<WriteHalf<DuplexStream>, JsonCodec<ContextRequest>>,
        FramedRead<ReadHalf<DuplexStream>, JsonCodec<ContextResponse>>,
    );

    fn start<H: TaskHandler>(
        handler: H,
    ) -> (PoolSide, tokio::task::JoinHandle<Result<(), WorkerError>>) {
        let (pool_end, worker_end) = tokio::io::duplex(64 * 1024);
        let (worker_r, worker_w) = tokio::io::split(worker_end);
        let worker = tokio::spawn(run_worker_on(Arc::new(handler), worker_r, worker_w));

        let (pool_r, pool_w) = tokio::io::split(pool_end);
        let side = (
            FramedWrite::new(pool_w, JsonCodec::new()),
            FramedRead::new(pool_r, JsonCodec::new()),
        );
        (side, worker)
    }

    fn init_request(entry: u64) -> ContextRequest {
        ContextRequest::Init {
            entry_id: EntryId::from(entry),
            memory_limit_mb: 128,
            task_timeout_ms: 1000,
        }
    }

    #[tokio::test]
    async fn handshake_then_tasks() {
        let ((mut tx, mut rx), worker) = start(TestHandler);

        tx.send(init_request(7)).await.unwrap();
        let ready = rx.next().await.unwrap().unwrap();
        assert!(matches!(ready, ContextResponse::Ready { entry_id } if entry_id == EntryId::from(7)));

        let task_id = TaskId::new();
        tx.send(ContextRequest::Task {
            task_id,
            payload: json!({"op": "echo", "value": [1, 2]}),
        })
        .await
        .unwrap();
        match rx.next().await.unwrap().unwrap() {
            ContextResponse::Success { task_id: id, data } => {
                assert_eq!(id, task_id);
                assert_eq!(data, json!([1, 2]));
            }
            other => panic!("expected success, got {other:?}"),
        }

        tx.send(ContextRequest::Task {
            task_id,
            payload: json!({"op": "fail"}),
        })
        .await
        .unwrap();
        match rx.next().await.unwrap().unwrap() {
            ContextResponse::Error { error, .. } => assert_eq!(error, "ValueError: nope"),
            other => panic!("expected error, got {other:?}"),
        }

        tx.send(ContextRequest::Shutdown).await.unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panic_becomes_error_reply() {
        let ((mut tx, mut rx), worker) = start(TestHandler);
        tx.send(init_request(1)).await.unwrap();
        rx.next().await.unwrap().unwrap();

        let task_id = TaskId::new();
        tx.send(ContextRequest::Task {
            task_id,
            payload: json!({"op": "panic"}),
        })
        .await
        .unwrap();
        match rx.next().await.unwrap().unwrap() {
            ContextResponse::Error { task_id: id, error } => {
                assert_eq!(id, task_id);
                assert_eq!(error, "task panicked: boom");
            }
            other => panic!("expected error, got {other:?}"),
        }

        // Still serving after the panic.
        tx.send(ContextRequest::Task {
            task_id: TaskId::new(),
            payload: json!({"op": "echo", "value": "alive"}),
        })
        .await
        .unwrap();
        assert!(matches!(
            rx.next().await.unwrap().unwrap(),
            ContextResponse::Success { .. }
        ));

        tx.send(ContextRequest::Shutdown).await.unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn task_before_init_is_rejected() {
        let ((mut tx, _rx), worker) = start(TestHandler);
        tx.send(ContextRequest::Task {
            task_id: TaskId::new(),
            payload: json!({}),
        })
        .await
        .unwrap();

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::Protocol(_)));
    }

    #[tokio::test]
    async fn eof_before_init_exits_cleanly() {
        let (pool_side, worker) = start(TestHandler);
        // Both halves must go for the worker to see EOF.
        drop(pool_side);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_init_ends_worker_without_ready() {
        let ((mut tx, mut rx), worker) = start(RefusingHandler);
        tx.send(init_request(3)).await.unwrap();

        let err = worker.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::Init(ref msg) if msg == "missing runtime"));
        // Worker side is gone; no ready was written.
        assert!(rx.next().await.is_none());
    }
}
