//! Dispatch of work items through leases, pooled clients and operation
//! spans.

pub mod factory;

pub use factory::{DaemonWorker, DispatchError, IsolationMode, WorkerDaemonFactory};
