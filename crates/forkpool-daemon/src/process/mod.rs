//! Worker process management: launching, talking to, and stopping workers.

pub mod child;
pub mod directory;
pub mod launcher;

pub use child::ChildProcessLauncher;
pub use directory::{DefaultWorkerDirectoryProvider, WorkerDirectoryProvider};
pub use launcher::{LaunchError, ProtocolError, WorkerLauncher, WorkerProcess};
