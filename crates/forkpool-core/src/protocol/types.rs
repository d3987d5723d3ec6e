//! Message types for the worker line protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::work::{WorkItem, WorkResult, WorkerKind};

/// Messages the host writes to a worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Run one work item.
    Execute {
        id: String,
        kind: WorkerKind,
        #[serde(flatten)]
        item: WorkItem,
    },
    /// Finish the current item, if any, and exit.
    Stop,
}

/// Messages a worker writes to its stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Sent once after startup.
    Ready(Ready),
    /// Outcome of an `Execute` request.
    Result(ExecuteResult),
    Unknown { msg_type: String, payload: Value },
}

/// Startup handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub pid: u32,
    #[serde(default)]
    pub kind: Option<WorkerKind>,
}

/// Correlated result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteResult {
    pub id: String,
    pub outcome: WorkResult,
}
