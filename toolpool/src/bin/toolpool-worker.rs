//! Diagnostic worker: runs a handful of built-in operations.
//!
//! Payloads are `{"op": ...}` objects:
//!
//! - `echo {value}`: return `value`
//! - `sleep {ms, value?}`: wait, then return `value`
//! - `fail {message}`: task error with `message`
//! - `exit {code}`: exit the process immediately
//! - `alloc {mb, hold_ms}`: allocate and touch `mb` MiB, hold it, return the size
//! - `panic {message}`: panic inside the handler

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use toolpool::{TaskHandler, WorkerInit};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    Echo {
        #[serde(default)]
        value: Value,
    },
    Sleep {
        ms: u64,
        #[serde(default)]
        value: Value,
    },
    Fail {
        message: String,
    },
    Exit {
        code: i32,
    },
    Alloc {
        mb: usize,
        #[serde(default)]
        hold_ms: u64,
    },
    Panic {
        message: String,
    },
}

struct BuiltinOps;

#[async_trait::async_trait]
impl TaskHandler for BuiltinOps {
    async fn init(&self, init: &WorkerInit) -> Result<(), String> {
        tracing::debug!(
            entry = %init.entry_id,
            memory_limit_mb = init.memory_limit_mb,
            task_timeout_ms = init.task_timeout.as_millis() as u64,
            "Diagnostic worker initialised"
        );
        Ok(())
    }

    async fn execute(&self, payload: Value) -> Result<Value, String> {
        let op: Op = serde_json::from_value(payload).map_err(|e| format!("invalid op: {e}"))?;
        match op {
            Op::Echo { value } => Ok(value),
            Op::Sleep { ms, value } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(value)
            }
            Op::Fail { message } => Err(message),
            Op::Exit { code } => {
                tracing::info!(code, "Exiting on request");
                std::process::exit(code)
            }
            Op::Alloc { mb, hold_ms } => {
                // Write every page so the memory is actually resident.
                let buf = vec![1u8; mb * 1024 * 1024];
                tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                Ok(json!({ "allocated_mb": buf.len() / (1024 * 1024) }))
            }
            Op::Panic { message } => panic!("{message}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    toolpool::logging::init();
    toolpool::run_worker(BuiltinOps).await?;
    Ok(())
}
