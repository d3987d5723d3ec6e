//! Seams between the pool and live worker processes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use forkpool_core::{ProcessConfiguration, WorkItem, WorkResult, WorkerKind};

/// A live worker process able to run work items one at a time.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// Run `item` and return the worker's outcome.
    ///
    /// An `Err` means the process can no longer be trusted and must not be
    /// reused.
    async fn execute(&self, kind: &WorkerKind, item: &WorkItem)
    -> Result<WorkResult, ProtocolError>;

    /// Stop the process. Safe to call more than once.
    async fn stop(&self);

    /// OS process id, when known.
    fn pid(&self) -> Option<u32>;
}

/// Starts worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        kind: &WorkerKind,
        working_directory: &Path,
        config: &ProcessConfiguration,
    ) -> Result<Box<dyn WorkerProcess>, LaunchError>;
}

/// A worker process could not be started.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn worker {executable}: {reason}")]
    SpawnFailed { executable: PathBuf, reason: String },

    #[error("Worker did not complete its startup handshake: {reason}")]
    Handshake { reason: String },

    #[error("Worker did not become ready within {secs}s")]
    StartupTimeout { secs: u64 },

    #[error("Worker working directory unavailable: {reason}")]
    WorkingDirectory { reason: String },
}

/// Communication with a running worker broke down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Worker exited mid-call")]
    Exited,

    #[error("Worker I/O failed: {reason}")]
    Io { reason: String },

    #[error("Malformed worker message: {reason}")]
    Malformed { reason: String },

    #[error("Worker answered request {got}, expected {expected}")]
    Mismatch { expected: String, got: String },

    #[error("Worker did not answer within {secs}s")]
    Timeout { secs: u64 },
}
