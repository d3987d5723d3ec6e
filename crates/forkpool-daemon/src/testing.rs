//! In-memory worker processes for unit tests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use forkpool_core::{ProcessConfiguration, WorkItem, WorkResult, WorkerKind};

use crate::memory::MemoryProbe;
use crate::process::{LaunchError, ProtocolError, WorkerLauncher, WorkerProcess};

/// Launches [`FakeProcess`]es and counts what happens to them.
#[derive(Default)]
pub struct FakeLauncher {
    launched: AtomicUsize,
    stopped: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    next_pid: AtomicU32,
    fail_next: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Highest number of executions seen running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(
        &self,
        _kind: &WorkerKind,
        _working_directory: &Path,
        _config: &ProcessConfiguration,
    ) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LaunchError::Handshake {
                reason: "fake launch failure".to_string(),
            });
        }
        self.launched.fetch_add(1, Ordering::SeqCst);
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            pid,
            stopped: AtomicBool::new(false),
            stop_counter: Arc::clone(&self.stopped),
            in_flight: Arc::clone(&self.in_flight),
            peak: Arc::clone(&self.peak),
        }))
    }
}

/// Interprets work item actions:
///
/// - `echo`: succeeds with the payload
/// - `pid`: succeeds with the fake process id
/// - `fail`: execution failure with `payload.message`
/// - `crash`: the process "exits" mid-call
/// - `panic`: panics inside the call
/// - `sleep`: sleeps `payload.millis` then succeeds with the payload
pub struct FakeProcess {
    pid: u32,
    stopped: AtomicBool,
    stop_counter: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    async fn execute(
        &self,
        _kind: &WorkerKind,
        item: &WorkItem,
    ) -> Result<WorkResult, ProtocolError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ProtocolError::Exited);
        }
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        match item.action.as_str() {
            "echo" => Ok(WorkResult::success(item.payload.clone())),
            "pid" => Ok(WorkResult::success(self.pid.into())),
            "fail" => Ok(WorkResult::execution_failure(
                item.payload["message"].as_str().unwrap_or("failed"),
            )),
            "crash" => Err(ProtocolError::Exited),
            #[allow(clippy::panic)]
            "panic" => panic!("worker blew up"),
            "sleep" => {
                let millis = item.payload["millis"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(WorkResult::success(item.payload.clone()))
            }
            other => Ok(WorkResult::execution_failure(format!(
                "unknown action {other}"
            ))),
        }
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }
}

/// Memory probe with fixed figures.
pub struct FixedMemoryProbe {
    pub total: Option<u64>,
    pub available: Option<u64>,
}

impl MemoryProbe for FixedMemoryProbe {
    fn total_memory(&self) -> Option<u64> {
        self.total
    }

    fn available_memory(&self) -> Option<u64> {
        self.available
    }
}
