#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Child process launcher against the reference worker binary.

use std::time::Duration;

use serde_json::json;

use forkpool_core::{ProcessConfiguration, WorkItem, WorkResult, WorkerKind};
use forkpool_daemon::process::{ChildProcessLauncher, ProtocolError, WorkerLauncher};

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_forkpool-worker");

fn launcher() -> ChildProcessLauncher {
    ChildProcessLauncher::new(
        Duration::from_secs(10),
        Some(Duration::from_secs(10)),
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn test_launch_execute_stop() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProcessConfiguration::new(WORKER_BIN)
        .with_module("core")
        .with_shared_package("org.example.api")
        .with_heap_mb(Some(32), Some(128))
        .with_argument("--log-level=warn");
    let kind = WorkerKind::new("compile");

    let process = launcher().launch(&kind, dir.path(), &config).await.unwrap();
    assert!(process.pid().is_some());

    let echo = WorkItem::new("echo", "echo", json!({"files": ["a.rs"]}));
    let result = process.execute(&kind, &echo).await.unwrap();
    assert_eq!(result, WorkResult::success(json!({"files": ["a.rs"]})));

    let sleep = WorkItem::new("sleep", "sleep", json!({"millis": 10}));
    let result = process.execute(&kind, &sleep).await.unwrap();
    assert_eq!(result, WorkResult::success(json!(null)));

    process.stop().await;
    // Stopping twice is harmless.
    process.stop().await;
    let err = process.execute(&kind, &echo).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Exited | ProtocolError::Io { .. }));
}

#[tokio::test]
async fn test_unknown_action_is_reported_by_worker() {
    let dir = tempfile::tempdir().unwrap();
    let kind = WorkerKind::new("misc");
    let process = launcher()
        .launch(&kind, dir.path(), &ProcessConfiguration::new(WORKER_BIN))
        .await
        .unwrap();

    let result = process
        .execute(&kind, &WorkItem::new("what", "teleport", json!(null)))
        .await
        .unwrap();

    assert!(result.failure().unwrap().message.contains("teleport"));
    process.stop().await;
}

#[tokio::test]
async fn test_execute_timeout_is_a_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let kind = WorkerKind::new("slow");
    let launcher = ChildProcessLauncher::new(
        Duration::from_secs(10),
        Some(Duration::from_millis(100)),
        Duration::from_secs(1),
    );
    let process = launcher
        .launch(&kind, dir.path(), &ProcessConfiguration::new(WORKER_BIN))
        .await
        .unwrap();

    let err = process
        .execute(&kind, &WorkItem::new("slow", "sleep", json!({"millis": 5_000})))
        .await
        .unwrap_err();

    assert!(matches!(err, ProtocolError::Timeout { .. }));
    process.stop().await;
}
