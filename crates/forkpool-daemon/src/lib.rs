//! forkpool daemon library
//!
//! Leased dispatch of work items to pooled out-of-process workers:
//! - Hierarchical leases bounding parallel work
//! - A pool of reusable worker clients keyed by process configuration
//! - Idle worker eviction under memory pressure
//! - Operation spans around every dispatched item

pub mod clients;
pub mod dispatch;
pub mod jobs;
pub mod lease;
pub mod memory;
pub mod operations;
pub mod process;
mod telemetry;

#[cfg(test)]
mod testing;

pub use dispatch::{DaemonWorker, DispatchError, IsolationMode, WorkerDaemonFactory};
