//! toolpool: bounded pool of isolated execution contexts for untrusted tool code.

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod pool;
pub mod worker;

/// Crate version from Cargo.toml.
pub const TOOLPOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{PoolConfig, TimeoutPolicy};
pub use context::{
    ContextEvent, ContextSpawnConfig, ContextSpawner, EventSender, ExecutionContext,
    ProcessContext, ProcessSpawner, TaskRequest,
};
pub use error::{ContextError, SpawnError, TaskError};
pub use pool::{EntrySnapshot, EntryStatus, PoolStats, WorkerPool};
pub use worker::{TaskHandler, WorkerInit, run_worker};
