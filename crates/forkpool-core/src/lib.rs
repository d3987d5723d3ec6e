//! `forkpool` Core Library
//!
//! Shared functionality for `forkpool` components:
//! - Process configuration and the worker reuse-compatibility rule
//! - Work item and work result types
//! - Line protocol between the pool and worker processes
//! - Configuration resolution and hierarchy
//! - Tracing initialisation and common error types

pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod process;
pub mod protocol;
pub mod tracing_init;
pub mod work;

pub use config::Config;
pub use error::{Error, Result};
pub use process::{KeepAliveMode, ProcessConfiguration};
pub use work::{FailureKind, WorkFailure, WorkItem, WorkResult, WorkerKind};
