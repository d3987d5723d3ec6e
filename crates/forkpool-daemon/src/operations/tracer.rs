//! Parent/child operation spans around dispatched work.
//!
//! [`OperationTracer::call`] runs a body inside a new operation whose parent
//! is given explicitly by its [`OperationDescriptor`]. The operation is
//! finished exactly once, whether the body returns, panics, or is dropped.
//! Tracing is observational: the body's output is returned untouched.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{Instrument, debug, info_span};

/// Broadcast buffer for operation events.
const EVENT_CAPACITY: usize = 256;

tokio::task_local! {
    static CURRENT_OPERATION: OperationId;
}

/// Identifier of one traced operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// What to call an operation and where it hangs in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub display_name: String,
    pub parent: Option<OperationId>,
}

impl OperationDescriptor {
    pub fn display_name(name: impl Into<String>) -> Self {
        Self {
            display_name: name.into(),
            parent: None,
        }
    }

    #[must_use]
    pub const fn parent(mut self, parent: Option<OperationId>) -> Self {
        self.parent = parent;
        self
    }
}

/// Handed to the body of a running operation.
#[derive(Debug, Clone, Copy)]
pub struct OperationContext {
    pub id: OperationId,
    pub parent: Option<OperationId>,
}

/// Lifecycle notifications published by the tracer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    Started {
        id: OperationId,
        parent: Option<OperationId>,
        display_name: String,
    },
    Finished {
        id: OperationId,
        elapsed: Duration,
        /// `false` when the body panicked or was dropped before completing.
        completed: bool,
    },
}

/// Runs bodies inside traced operations.
#[derive(Clone)]
pub struct OperationTracer {
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<OperationEvent>,
}

impl OperationTracer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    /// Operation bound to the calling task, if any.
    pub fn current_operation(&self) -> Option<OperationId> {
        CURRENT_OPERATION.try_with(|id| *id).ok()
    }

    /// Subscribe to operation start/finish events.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.events.subscribe()
    }

    /// Run `body` inside a new operation described by `descriptor`.
    pub async fn call<F, Fut, T>(&self, descriptor: OperationDescriptor, body: F) -> T
    where
        F: FnOnce(OperationContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context = OperationContext {
            id,
            parent: descriptor.parent,
        };
        let span = info_span!(
            "operation",
            id = %id,
            name = %descriptor.display_name,
            parent = ?descriptor.parent.map(|p| p.to_string()),
        );

        debug!(operation = %id, name = %descriptor.display_name, "Operation started");
        // No subscribers is fine; events are best-effort.
        let _ = self.events.send(OperationEvent::Started {
            id,
            parent: descriptor.parent,
            display_name: descriptor.display_name,
        });

        let mut guard = FinishGuard {
            id,
            started: Instant::now(),
            events: self.events.clone(),
            completed: false,
        };
        let output = CURRENT_OPERATION
            .scope(id, body(context))
            .instrument(span)
            .await;
        guard.completed = true;
        output
    }
}

impl Default for OperationTracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes `Finished` exactly once, on drop.
struct FinishGuard {
    id: OperationId,
    started: Instant,
    events: broadcast::Sender<OperationEvent>,
    completed: bool,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        debug!(
            operation = %self.id,
            elapsed_ms = elapsed.as_millis(),
            completed = self.completed,
            "Operation finished"
        );
        let _ = self.events.send(OperationEvent::Finished {
            id: self.id,
            elapsed,
            completed: self.completed,
        });
    }
}
