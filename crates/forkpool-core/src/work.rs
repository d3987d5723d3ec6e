//! Work items submitted to workers and the results they produce.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the worker implementation a process runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerKind(String);

impl WorkerKind {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work dispatched to a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Human-readable name, used for the operation span.
    pub display_name: String,
    /// Action the worker should perform.
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

impl WorkItem {
    pub fn new(display_name: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            display_name: display_name.into(),
            action: action.into(),
            payload,
        }
    }
}

/// Why a work item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker ran the item and reported an application-level fault.
    Execution,
    /// The worker stopped responding or broke the line protocol mid-call.
    Protocol,
}

/// A captured failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for WorkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::Execution => write!(f, "execution failed: {}", self.message),
            FailureKind::Protocol => write!(f, "worker protocol failure: {}", self.message),
        }
    }
}

/// Outcome of one dispatched work item: a value or a failure, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkResult {
    Success { value: Value },
    Failure(WorkFailure),
}

impl WorkResult {
    pub const fn success(value: Value) -> Self {
        Self::Success { value }
    }

    pub fn execution_failure(message: impl Into<String>) -> Self {
        Self::Failure(WorkFailure {
            kind: FailureKind::Execution,
            message: message.into(),
        })
    }

    pub fn protocol_failure(message: impl Into<String>) -> Self {
        Self::Failure(WorkFailure {
            kind: FailureKind::Protocol,
            message: message.into(),
        })
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub const fn failure(&self) -> Option<&WorkFailure> {
        match self {
            Self::Failure(failure) => Some(failure),
            Self::Success { .. } => None,
        }
    }
}
