//! Dispatches work items to pooled worker processes.
//!
//! A dispatch walks a fixed path: take a child lease under the caller's
//! lease, reserve a compatible idle client (or spawn one), run the item inside
//! an operation span, hand the client back, close the lease. Every exit from
//! that path, including panics and cancellation, gives back the client and
//! the lease.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use forkpool_core::{Config, ProcessConfiguration, WorkItem, WorkResult, WorkerKind};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::clients::{ClientsError, ReservedClient, WorkerClientsManager};
use crate::lease::{LeaseError, LeaseId, LeaseRegistry, with_current_lease};
use crate::memory::{IdleWorkerExpiration, MemoryHolder, MemoryMonitor};
use crate::operations::{OperationDescriptor, OperationId, OperationTracer};
use crate::process::{
    ChildProcessLauncher, DefaultWorkerDirectoryProvider, LaunchError, WorkerDirectoryProvider,
};

/// How a worker is isolated from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IsolationMode {
    /// Runs in a separate worker process.
    Process,
}

struct FactoryInner {
    clients: WorkerClientsManager,
    memory: Arc<MemoryMonitor>,
    expiration: Arc<dyn MemoryHolder>,
    leases: LeaseRegistry,
    tracer: OperationTracer,
    directories: Arc<dyn WorkerDirectoryProvider>,
    stopped: AtomicBool,
}

/// Hands out [`DaemonWorker`]s that run items in pooled worker processes.
#[derive(Clone)]
pub struct WorkerDaemonFactory {
    inner: Arc<FactoryInner>,
}

impl WorkerDaemonFactory {
    /// Wire a factory and register its idle worker evictor with `memory`.
    pub fn new(
        clients: WorkerClientsManager,
        memory: Arc<MemoryMonitor>,
        leases: LeaseRegistry,
        tracer: OperationTracer,
        directories: Arc<dyn WorkerDirectoryProvider>,
    ) -> Self {
        let total = memory.total_physical_memory();
        if total.is_none() {
            warn!("Total physical memory unknown; idle workers will be evicted one per request");
        }
        let expiration: Arc<dyn MemoryHolder> =
            Arc::new(IdleWorkerExpiration::new(clients.clone(), total));
        memory.add_memory_holder(Arc::clone(&expiration));

        info!(
            max_workers = leases.max_permits(),
            total_memory = ?total,
            "Worker daemon factory ready"
        );

        Self {
            inner: Arc::new(FactoryInner {
                clients,
                memory,
                expiration,
                leases,
                tracer,
                directories,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Factory spawning real worker processes as described by `config`.
    pub fn from_config(config: &Config, memory: Arc<MemoryMonitor>) -> Self {
        let launcher = Arc::new(ChildProcessLauncher::from_config(&config.pool));
        let directories = Arc::new(DefaultWorkerDirectoryProvider::from_config(
            config.pool.worker_directory.clone(),
        ));
        Self::new(
            WorkerClientsManager::new(launcher),
            memory,
            LeaseRegistry::new(config.pool.max_workers),
            OperationTracer::new(),
            directories,
        )
    }

    /// A worker running `kind` items in processes compatible with `config`.
    pub fn get_worker(&self, kind: WorkerKind, config: ProcessConfiguration) -> DaemonWorker {
        DaemonWorker {
            factory: self.clone(),
            kind,
            config,
        }
    }

    pub const fn isolation_mode(&self) -> IsolationMode {
        IsolationMode::Process
    }

    pub fn clients(&self) -> &WorkerClientsManager {
        &self.inner.clients
    }

    pub fn leases(&self) -> &LeaseRegistry {
        &self.inner.leases
    }

    pub fn tracer(&self) -> &OperationTracer {
        &self.inner.tracer
    }

    pub fn memory(&self) -> &Arc<MemoryMonitor> {
        &self.inner.memory
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop every worker and refuse further dispatches. Idempotent.
    ///
    /// Dispatches waiting for a lease fail with [`DispatchError::Stopped`].
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping worker daemon factory");
        self.inner
            .memory
            .remove_memory_holder(&self.inner.expiration);
        self.inner.leases.close();
        self.inner.clients.stop_all().await;
    }
}

/// A handle for running items of one kind under one process configuration.
#[derive(Clone)]
pub struct DaemonWorker {
    factory: WorkerDaemonFactory,
    kind: WorkerKind,
    config: ProcessConfiguration,
}

impl DaemonWorker {
    pub const fn kind(&self) -> &WorkerKind {
        &self.kind
    }

    pub const fn config(&self) -> &ProcessConfiguration {
        &self.config
    }

    /// Run `item` under the calling task's current lease and operation.
    pub async fn execute(&self, item: WorkItem) -> Result<WorkResult, DispatchError> {
        let inner = &self.factory.inner;
        let parent_lease = inner.leases.current_lease();
        let parent_operation = inner.tracer.current_operation();
        self.execute_with(item, parent_lease, parent_operation).await
    }

    /// Run `item` under an explicit parent lease and operation.
    ///
    /// Worker-side failures, broken worker processes and panics come back
    /// as a failed [`WorkResult`]. Startup failures, shutdown and
    /// bookkeeping violations are errors.
    pub async fn execute_with(
        &self,
        item: WorkItem,
        parent_lease: LeaseId,
        parent_operation: Option<OperationId>,
    ) -> Result<WorkResult, DispatchError> {
        let inner = &self.factory.inner;
        if self.factory.is_stopped() {
            return Err(DispatchError::Stopped);
        }

        let lease = inner
            .leases
            .start_child(parent_lease, item.display_name.clone())
            .await
            .map_err(DispatchError::from_lease)?;

        let client = match self.reserve().await {
            Ok(client) => client,
            Err(e) => {
                if let Err(lease_err) = lease.finish() {
                    warn!(error = %lease_err, "Failed to release lease after reservation failure");
                }
                return Err(e);
            }
        };
        debug!(
            lease = %lease.id(),
            pid = client.pid(),
            item = %item.display_name,
            "Dispatching work item"
        );

        let lease_id = lease.id();
        let descriptor =
            OperationDescriptor::display_name(item.display_name.clone()).parent(parent_operation);
        let outcome = inner
            .tracer
            .call(descriptor, |_| {
                with_current_lease(
                    lease_id,
                    AssertUnwindSafe(client.execute(&self.kind, &item)).catch_unwind(),
                )
            })
            .await;

        let (result, returned) = match outcome {
            Ok(Ok(result)) => (result, inner.clients.release(client)),
            Ok(Err(e)) => {
                warn!(error = %e, item = %item.display_name, "Worker failed mid-call; discarding it");
                let returned = inner.clients.discard(client).await;
                (WorkResult::protocol_failure(e.to_string()), returned)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(panic = %message, item = %item.display_name, "Worker call panicked; discarding it");
                let returned = inner.clients.discard(client).await;
                (
                    WorkResult::protocol_failure(format!("worker call panicked: {message}")),
                    returned,
                )
            }
        };

        let released = lease.finish();
        returned.map_err(DispatchError::from)?;
        released.map_err(DispatchError::from_lease)?;
        Ok(result)
    }

    async fn reserve(&self) -> Result<ReservedClient, DispatchError> {
        let inner = &self.factory.inner;
        if let Some(client) = inner.clients.reserve_idle_client(&self.config)? {
            return Ok(client);
        }
        let directory = inner.directories.idle_working_directory().map_err(|e| {
            DispatchError::Startup(LaunchError::WorkingDirectory {
                reason: e.to_string(),
            })
        })?;
        Ok(inner
            .clients
            .reserve_new_client(&self.kind, &directory, &self.config)
            .await?)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Errors that abort a dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Worker daemon factory has been stopped")]
    Stopped,

    #[error(transparent)]
    Startup(#[from] LaunchError),

    #[error("Lease bookkeeping violation: {0}")]
    Lease(LeaseError),

    #[error("Worker client bookkeeping violation: {0}")]
    Clients(ClientsError),
}

impl DispatchError {
    fn from_lease(e: LeaseError) -> Self {
        match e {
            LeaseError::Closed => Self::Stopped,
            e => Self::Lease(e),
        }
    }

    /// Whether this error is a broken acquire/release contract.
    pub const fn is_bookkeeping_violation(&self) -> bool {
        match self {
            Self::Lease(e) => e.is_bookkeeping_violation(),
            Self::Clients(e) => e.is_bookkeeping_violation(),
            Self::Stopped | Self::Startup(_) => false,
        }
    }
}

impl From<ClientsError> for DispatchError {
    fn from(e: ClientsError) -> Self {
        match e {
            ClientsError::ShuttingDown => Self::Stopped,
            ClientsError::Startup(e) => Self::Startup(e),
            e => Self::Clients(e),
        }
    }
}
