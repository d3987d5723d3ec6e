//! Process-wide memory monitor.
//!
//! Components that can give memory back register as [`MemoryHolder`]s. The
//! monitor asks them to release memory either on demand
//! ([`MemoryMonitor::request_free_memory`]) or from a periodic task that
//! watches available physical memory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forkpool_core::config::MemoryConfig;
use parking_lot::Mutex;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info, warn};

/// Something that can free memory on request.
#[async_trait]
pub trait MemoryHolder: Send + Sync {
    /// Try to free about `bytes` and return an estimate of what was freed.
    ///
    /// Best effort; never fails.
    async fn attempt_to_release(&self, bytes: u64) -> u64;
}

/// Source of physical memory figures.
pub trait MemoryProbe: Send + Sync {
    /// Total physical memory in bytes, if it can be determined.
    fn total_memory(&self) -> Option<u64>;
    /// Currently available physical memory in bytes, if it can be determined.
    fn available_memory(&self) -> Option<u64>;
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn total_memory(&self) -> Option<u64> {
        // sysinfo reports 0 on platforms it cannot read.
        Some(self.system.lock().total_memory()).filter(|&bytes| bytes > 0)
    }

    fn available_memory(&self) -> Option<u64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        Some(system.available_memory()).filter(|&bytes| bytes > 0)
    }
}

/// Registry of memory holders plus the probe used to watch the host.
pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    holders: Mutex<Vec<Arc<dyn MemoryHolder>>>,
}

impl MemoryMonitor {
    pub fn new(probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            holders: Mutex::new(Vec::new()),
        }
    }

    /// Monitor probing the host through `sysinfo`.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemMemoryProbe::new()))
    }

    pub fn total_physical_memory(&self) -> Option<u64> {
        self.probe.total_memory()
    }

    pub fn available_physical_memory(&self) -> Option<u64> {
        self.probe.available_memory()
    }

    pub fn add_memory_holder(&self, holder: Arc<dyn MemoryHolder>) {
        self.holders.lock().push(holder);
    }

    /// Unregister `holder`. Returns whether it was registered.
    pub fn remove_memory_holder(&self, holder: &Arc<dyn MemoryHolder>) -> bool {
        let mut holders = self.holders.lock();
        let before = holders.len();
        holders.retain(|h| !Arc::ptr_eq(h, holder));
        holders.len() != before
    }

    pub fn holder_count(&self) -> usize {
        self.holders.lock().len()
    }

    /// Ask holders, in registration order, to free memory until `bytes` is
    /// covered. Returns the total estimate freed.
    pub async fn request_free_memory(&self, bytes: u64) -> u64 {
        let holders: Vec<Arc<dyn MemoryHolder>> = self.holders.lock().clone();
        let mut freed = 0u64;
        for holder in holders {
            if freed >= bytes {
                break;
            }
            freed = freed.saturating_add(holder.attempt_to_release(bytes - freed).await);
        }
        debug!(requested = bytes, freed, "Memory release request handled");
        freed
    }

    /// Bytes that must be freed to bring available memory back to the floor
    /// configured in `config`, if any.
    pub fn shortfall(&self, config: &MemoryConfig) -> Option<u64> {
        free_memory_shortfall(
            self.probe.total_memory(),
            self.probe.available_memory()?,
            config,
        )
    }

    /// Spawn a task that checks available memory every
    /// `config.poll_interval_ms` and requests the shortfall from holders.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        config: MemoryConfig,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(config.poll_interval_ms.max(1));
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // Skip first immediate tick
            info!(interval_ms = config.poll_interval_ms, "Memory monitor started");

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let Some(shortfall) = monitor.shortfall(&config) else {
                            continue;
                        };
                        let freed = monitor.request_free_memory(shortfall).await;
                        if freed < shortfall {
                            warn!(shortfall, freed, "Low memory; holders could not cover the shortfall");
                        } else {
                            info!(shortfall, freed, "Low memory; released idle resources");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Memory monitor shutting down");
                        return;
                    }
                }
            }
        })
    }
}

/// Free-memory floor is the larger of `min_free_bytes` and
/// `min_free_ratio` of total memory.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn free_memory_shortfall(
    total: Option<u64>,
    available: u64,
    config: &MemoryConfig,
) -> Option<u64> {
    let ratio_floor = total.map_or(0, |total| (total as f64 * config.min_free_ratio) as u64);
    let floor = config.min_free_bytes.max(ratio_floor);
    (available < floor).then(|| floor - available)
}
