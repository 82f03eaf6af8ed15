//! `toolpool`: run JSON payloads from stdin through a worker pool.
//!
//! Each stdin line is one payload. Each stdout line is
//! `{"index": n, "ok": value}` or `{"index": n, "error": message}`, in
//! completion order. Pool settings come from `TOOLPOOL_*` variables.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context as _;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use toolpool::{PoolConfig, ProcessSpawner, TOOLPOOL_VERSION, WorkerPool};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let worker = match parse_args(&args) {
        Ok(Some(v)) => v,
        Ok(None) => {
            println!("toolpool {TOOLPOOL_VERSION}");
            return;
        }
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: toolpool [--worker <path>]");
            eprintln!();
            eprintln!("Reads one JSON payload per line from stdin and prints one result per line.");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --worker <path>  Worker executable [default: toolpool-worker next to this binary]");
            eprintln!("  --version        Print version");
            process::exit(2);
        }
    };

    toolpool::logging::init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(worker)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

/// `Ok(None)` means `--version`.
fn parse_args(args: &[String]) -> Result<Option<Option<PathBuf>>, String> {
    let mut worker: Option<PathBuf> = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--worker" => {
                i += 1;
                worker = Some(PathBuf::from(
                    args.get(i).ok_or("--worker requires a value")?,
                ));
            }
            "--version" | "-V" => return Ok(None),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Some(worker))
}

fn default_worker() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let dir = exe
        .parent()
        .context("own executable has no parent directory")?;
    Ok(dir.join("toolpool-worker"))
}

async fn run(worker: Option<PathBuf>) -> anyhow::Result<()> {
    let config = PoolConfig::from_env()?;
    let worker = match worker {
        Some(path) => path,
        None => default_worker()?,
    };
    tracing::info!(
        version = TOOLPOOL_VERSION,
        worker = %worker.display(),
        max_concurrency = config.max_concurrency,
        "Starting toolpool"
    );

    let pool = WorkerPool::new(config, Arc::new(ProcessSpawner::new(worker)));
    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<Value>();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submitted = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let index = submitted;
        submitted += 1;

        let payload: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let _ = results_tx.send(json!({ "index": index, "error": format!("invalid JSON: {e}") }));
                continue;
            }
        };
        let result = pool.run(payload);
        let tx = results_tx.clone();
        tokio::spawn(async move {
            let line = match result.await {
                Ok(value) => json!({ "index": index, "ok": value }),
                Err(e) => json!({ "index": index, "error": e.to_string() }),
            };
            let _ = tx.send(line);
        });
    }
    drop(results_tx);

    let mut stdout = tokio::io::stdout();
    let mut written = 0usize;
    while let Some(line) = results_rx.recv().await {
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        stdout.write_all(&bytes).await?;
        written += 1;
    }
    stdout.flush().await?;

    if let Some(stats) = pool.stats().await {
        tracing::info!(
            tasks = written,
            spawned = stats.spawned,
            total = stats.total,
            "All tasks finished"
        );
    }
    pool.shutdown().await;
    Ok(())
}
