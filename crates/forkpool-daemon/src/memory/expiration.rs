//! Evicts idle worker clients when the host runs low on memory.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::monitor::MemoryHolder;
use crate::clients::{WorkerClient, WorkerClientsManager};
use crate::telemetry;

/// [`MemoryHolder`] that stops idle workers, least recently used first.
pub struct IdleWorkerExpiration {
    clients: WorkerClientsManager,
    total_physical_memory: Option<u64>,
}

impl IdleWorkerExpiration {
    pub const fn new(clients: WorkerClientsManager, total_physical_memory: Option<u64>) -> Self {
        Self {
            clients,
            total_physical_memory,
        }
    }

    /// Estimated resident size of `client`, if known.
    pub fn estimated_footprint(&self, client: &WorkerClient) -> Option<u64> {
        footprint(client, self.total_physical_memory)
    }
}

/// Configured max heap, else a quarter of physical memory.
fn footprint(client: &WorkerClient, total_physical_memory: Option<u64>) -> Option<u64> {
    client
        .config()
        .max_heap_bytes()
        .or_else(|| total_physical_memory.map(|total| total / 4))
}

/// Pick clients from `idle` (oldest first) until their estimated footprint
/// covers `requested`. A client of unknown size ends the selection.
fn select_for_release(
    idle: &[Arc<WorkerClient>],
    requested: u64,
    total_physical_memory: Option<u64>,
) -> (Vec<Arc<WorkerClient>>, u64) {
    let mut selected = Vec::new();
    let mut freed = 0u64;
    for client in idle {
        if freed >= requested {
            break;
        }
        selected.push(Arc::clone(client));
        match footprint(client, total_physical_memory) {
            Some(bytes) => freed = freed.saturating_add(bytes),
            None => break,
        }
    }
    (selected, freed)
}

#[async_trait]
impl MemoryHolder for IdleWorkerExpiration {
    async fn attempt_to_release(&self, bytes: u64) -> u64 {
        if bytes == 0 {
            return 0;
        }
        let total = self.total_physical_memory;
        let mut freed = 0u64;
        let stopped = self
            .clients
            .select_idle_clients_to_stop(|idle| {
                let (selected, estimate) = select_for_release(idle, bytes, total);
                freed = estimate;
                selected
            })
            .await;

        if stopped.is_empty() {
            debug!(requested = bytes, "No idle workers to evict");
        } else {
            info!(
                requested = bytes,
                freed,
                count = stopped.len(),
                "Evicted idle workers to free memory"
            );
            telemetry::clients_evicted(stopped.len(), freed);
        }
        freed
    }
}
