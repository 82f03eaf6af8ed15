//! End-to-end tests against the `toolpool-worker` binary.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use toolpool::{PoolConfig, ProcessSpawner, TaskError, TimeoutPolicy, WorkerPool};

fn worker_spawner() -> Arc<ProcessSpawner> {
    Arc::new(ProcessSpawner::new(env!("CARGO_BIN_EXE_toolpool-worker")))
}

fn pool(config: PoolConfig) -> WorkerPool {
    WorkerPool::new(config, worker_spawner())
}

#[tokio::test]
async fn echo_reuses_one_context() {
    let pool = pool(PoolConfig::new().with_max_concurrency(2));

    for i in 0..3 {
        let result = pool.run(json!({"op": "echo", "value": {"n": i}})).await;
        assert_eq!(result, Ok(json!({"n": i})));
    }

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.spawned, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.entries[0].tasks_completed, 3);
    pool.shutdown().await;
}

#[tokio::test]
async fn task_error_passes_through() {
    let pool = pool(PoolConfig::new());

    let result = pool
        .run(json!({"op": "fail", "message": "TypeError: fetch is not a function"}))
        .await;
    assert_eq!(
        result,
        Err(TaskError::Task("TypeError: fetch is not a function".to_string()))
    );

    // Same context keeps working.
    assert_eq!(pool.run(json!({"op": "echo", "value": 1})).await, Ok(json!(1)));
    assert_eq!(pool.stats().await.unwrap().spawned, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn malformed_payload_is_a_task_error() {
    let pool = pool(PoolConfig::new());
    let result = pool.run(json!({"op": "teleport"})).await;
    assert!(matches!(result, Err(TaskError::Task(ref msg)) if msg.starts_with("invalid op")));
    pool.shutdown().await;
}

#[tokio::test]
async fn exit_is_a_crash_and_pool_recovers() {
    let pool = pool(PoolConfig::new().with_max_concurrency(1));

    let result = pool.run(json!({"op": "exit", "code": 3})).await;
    assert_eq!(result, Err(TaskError::Crashed));
    assert_eq!(result.unwrap_err().to_string(), "error");
    assert_eq!(pool.stats().await.unwrap().total, 0);

    assert_eq!(pool.run(json!({"op": "echo", "value": "back"})).await, Ok(json!("back")));
    assert_eq!(pool.stats().await.unwrap().spawned, 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn panic_in_handler_is_a_task_error() {
    let pool = pool(PoolConfig::new());
    let result = pool.run(json!({"op": "panic", "message": "kaboom"})).await;
    assert_eq!(result, Err(TaskError::Task("task panicked: kaboom".to_string())));
    pool.shutdown().await;
}

#[tokio::test]
async fn timeout_with_terminate_policy_replaces_context() {
    let pool = pool(
        PoolConfig::new()
            .with_max_concurrency(1)
            .with_task_timeout(Duration::from_millis(300))
            .with_timeout_policy(TimeoutPolicy::Terminate),
    );

    let start = Instant::now();
    let result = pool.run(json!({"op": "sleep", "ms": 10_000})).await;
    assert_eq!(result, Err(TaskError::Timeout));
    assert!(start.elapsed() < Duration::from_secs(5));

    assert_eq!(pool.run(json!({"op": "echo", "value": 2})).await, Ok(json!(2)));
    assert_eq!(pool.stats().await.unwrap().spawned, 2);
    pool.shutdown().await;
}

#[tokio::test]
async fn saturated_pool_queues_excess_tasks() {
    let pool = pool(PoolConfig::new().with_max_concurrency(2));

    let start = Instant::now();
    let results: Vec<_> = (0..4)
        .map(|i| pool.run(json!({"op": "sleep", "ms": 300, "value": i})))
        .collect();

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.queued, 2);

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.await, Ok(json!(i)));
    }
    // Two waves of two.
    assert!(start.elapsed() >= Duration::from_millis(600));
    assert_eq!(pool.stats().await.unwrap().spawned, 2);
    pool.shutdown().await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn memory_limit_kills_context() {
    let pool = pool(PoolConfig::new().with_memory_limit_mb(64));

    let result = pool
        .run(json!({"op": "alloc", "mb": 256, "hold_ms": 2_000}))
        .await;
    assert_eq!(result, Err(TaskError::Crashed));
    assert_eq!(pool.stats().await.unwrap().total, 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_running_task() {
    let pool = pool(PoolConfig::new());

    let running = pool.run(json!({"op": "sleep", "ms": 10_000}));
    pool.stats().await.unwrap();
    pool.shutdown().await;

    assert_eq!(running.await, Err(TaskError::ShuttingDown));
    assert_eq!(
        pool.run(json!({"op": "echo"})).await,
        Err(TaskError::ShuttingDown)
    );
}

#[tokio::test]
async fn missing_worker_binary_is_a_spawn_error() {
    let pool = WorkerPool::new(
        PoolConfig::new(),
        Arc::new(ProcessSpawner::new("/nonexistent/toolpool-worker")),
    );

    let result = pool.run(json!({"op": "echo"})).await;
    assert!(matches!(result, Err(TaskError::Spawn(_))), "{result:?}");
    assert_eq!(pool.stats().await.unwrap().total, 0);
}
