//! Memory-pressure handling: the host memory monitor and the idle worker
//! evictor registered with it.

pub mod expiration;
pub mod monitor;

pub use expiration::IdleWorkerExpiration;
pub use monitor::{MemoryHolder, MemoryMonitor, MemoryProbe, SystemMemoryProbe};
