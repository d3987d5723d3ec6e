//! `forkpool-worker`
//!
//! Reference worker process. Speaks the line protocol on stdin/stdout and
//! understands a handful of actions:
//!
//! - `echo`: returns the payload
//! - `sleep`: waits `payload.millis` milliseconds, returns null
//! - `fail`: reports a failure carrying `payload.message`
//! - `exit`: exits immediately with `payload.code`

use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use forkpool_core::protocol::{ExecuteResult, HostMessage, Ready, WorkerMessage};
use forkpool_core::protocol::{encode, parse_host_line};
use forkpool_core::{WorkItem, WorkResult, WorkerKind};

#[derive(Parser, Debug)]
#[command(name = "forkpool-worker")]
#[command(version, about = "forkpool reference worker process")]
struct Args {
    /// Worker kind this process was started for.
    #[arg(long)]
    kind: Option<String>,

    /// Module made available to the worker.
    #[arg(long = "module")]
    modules: Vec<String>,

    /// Package shared with the host.
    #[arg(long = "shared")]
    shared_packages: Vec<String>,

    #[arg(long)]
    min_heap_mb: Option<u64>,

    #[arg(long)]
    max_heap_mb: Option<u64>,

    /// Extra arguments from the process configuration.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    extra: Vec<String>,

    /// Log level filter for the worker's stderr.
    #[arg(long, default_value = "warn", env = "FORKPOOL_WORKER_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    forkpool_core::tracing_init::init_tracing(
        &format!("forkpool_worker={}", args.log_level),
        false,
    );

    let pid = std::process::id();
    info!(
        pid,
        kind = ?args.kind,
        modules = args.modules.len(),
        shared = args.shared_packages.len(),
        min_heap_mb = ?args.min_heap_mb,
        max_heap_mb = ?args.max_heap_mb,
        extra = ?args.extra,
        "Worker starting"
    );

    let mut stdout = tokio::io::stdout();
    let ready = WorkerMessage::Ready(Ready {
        pid,
        kind: args.kind.map(WorkerKind::new),
    });
    write_line(&mut stdout, &encode(&ready)).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_host_line(&line) {
            Ok(HostMessage::Execute { id, kind, item }) => {
                debug!(%id, %kind, action = %item.action, "Executing");
                let outcome = perform(&item).await;
                let reply = WorkerMessage::Result(ExecuteResult { id, outcome });
                write_line(&mut stdout, &encode(&reply)).await?;
            }
            Ok(HostMessage::Stop) => {
                info!("Stop requested");
                break;
            }
            Err(e) => warn!(error = %e, "Ignoring unparseable host message"),
        }
    }

    info!("Worker exiting");
    Ok(())
}

async fn perform(item: &WorkItem) -> WorkResult {
    match item.action.as_str() {
        "echo" => WorkResult::success(item.payload.clone()),
        "sleep" => {
            let millis = item.payload["millis"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            WorkResult::success(Value::Null)
        }
        "fail" => WorkResult::execution_failure(
            item.payload["message"]
                .as_str()
                .unwrap_or("work item failed"),
        ),
        "exit" => {
            let code = item.payload["code"]
                .as_i64()
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(1);
            warn!(code, "Exiting on request");
            std::process::exit(code);
        }
        other => WorkResult::execution_failure(format!("unknown action: {other}")),
    }
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
