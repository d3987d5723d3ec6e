//! A handle to one live worker process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use forkpool_core::{ProcessConfiguration, WorkItem, WorkResult, WorkerKind};

use crate::process::{ProtocolError, WorkerProcess};

/// Unique identifier of a worker client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Availability of a pooled client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Alive and free to reserve.
    Idle,
    /// Handed out to exactly one caller.
    Reserved,
    /// Process stopped; terminal.
    Stopped,
}

/// A live worker process together with the configuration it was started with.
pub struct WorkerClient {
    id: ClientId,
    kind: WorkerKind,
    config: ProcessConfiguration,
    process: Box<dyn WorkerProcess>,
    executions: AtomicU64,
}

impl WorkerClient {
    pub(crate) fn new(
        kind: WorkerKind,
        config: ProcessConfiguration,
        process: Box<dyn WorkerProcess>,
    ) -> Self {
        Self {
            id: ClientId::generate(),
            kind,
            config,
            process,
            executions: AtomicU64::new(0),
        }
    }

    pub const fn id(&self) -> &ClientId {
        &self.id
    }

    /// Worker kind the process was first started for.
    pub const fn kind(&self) -> &WorkerKind {
        &self.kind
    }

    /// Configuration the process is running with.
    pub const fn config(&self) -> &ProcessConfiguration {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Number of work items sent to this client so far.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub(crate) async fn execute(
        &self,
        kind: &WorkerKind,
        item: &WorkItem,
    ) -> Result<WorkResult, ProtocolError> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.process.execute(kind, item).await
    }

    pub(crate) async fn stop(&self) {
        self.process.stop().await;
    }
}

impl fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerClient")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pid", &self.pid())
            .field("executable", &self.config.executable)
            .finish_non_exhaustive()
    }
}
