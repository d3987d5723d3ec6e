//! Pool of reusable worker clients.
//!
//! [`WorkerClientsManager`] owns every live worker process. Callers reserve an
//! idle client whose configuration is compatible with theirs, or have a new
//! one spawned, and hand it back when done. All state transitions happen
//! under one pool-wide mutex that is never held across process I/O, so a
//! client can never be handed out and evicted at the same time.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use forkpool_core::{ProcessConfiguration, WorkItem, WorkResult, WorkerKind};
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::client::{ClientId, ClientState, WorkerClient};
use crate::process::{LaunchError, ProtocolError, WorkerLauncher};
use crate::telemetry;

struct Entry {
    client: Arc<WorkerClient>,
    state: ClientState,
    /// Position in release order; larger is more recent.
    release_seq: u64,
    last_released: Option<Instant>,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<ClientId, Entry>,
    next_seq: u64,
    stopped: bool,
}

impl PoolState {
    /// Idle entries, least recently released first.
    fn idle_lru(&self) -> Vec<&Entry> {
        let mut idle: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.state == ClientState::Idle)
            .collect();
        idle.sort_by_key(|e| e.release_seq);
        idle
    }
}

struct Inner {
    launcher: Arc<dyn WorkerLauncher>,
    state: Mutex<PoolState>,
}

/// Owns the live worker clients and arbitrates their reservation.
#[derive(Clone)]
pub struct WorkerClientsManager {
    inner: Arc<Inner>,
}

impl WorkerClientsManager {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Reserve the most recently released idle client compatible with
    /// `config`, if there is one. Never blocks on I/O.
    pub fn reserve_idle_client(
        &self,
        config: &ProcessConfiguration,
    ) -> Result<Option<ReservedClient>, ClientsError> {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return Err(ClientsError::ShuttingDown);
        }

        let Some(entry) = state
            .entries
            .values_mut()
            .filter(|e| e.state == ClientState::Idle && e.client.config().is_compatible_with(config))
            .max_by_key(|e| e.release_seq)
        else {
            return Ok(None);
        };
        entry.state = ClientState::Reserved;
        let client = Arc::clone(&entry.client);
        drop(state);

        debug!(client = %client.id(), pid = client.pid(), "Reserved idle worker client");
        telemetry::client_reused();
        Ok(Some(self.reserved(client)))
    }

    /// Start a new worker process for `config` and reserve it.
    ///
    /// Startup failures are returned as-is; retrying is the caller's call.
    pub async fn reserve_new_client(
        &self,
        kind: &WorkerKind,
        working_directory: &Path,
        config: &ProcessConfiguration,
    ) -> Result<ReservedClient, ClientsError> {
        if self.inner.state.lock().stopped {
            return Err(ClientsError::ShuttingDown);
        }

        let process = self
            .inner
            .launcher
            .launch(kind, working_directory, config)
            .await?;
        let client = Arc::new(WorkerClient::new(kind.clone(), config.clone(), process));

        let registered = {
            let mut state = self.inner.state.lock();
            if state.stopped {
                None
            } else {
                state.entries.insert(
                    client.id().clone(),
                    Entry {
                        client: Arc::clone(&client),
                        state: ClientState::Reserved,
                        release_seq: 0,
                        last_released: None,
                    },
                );
                Some(state.entries.len())
            }
        };
        let Some(size) = registered else {
            warn!(client = %client.id(), "Pool stopped while worker was starting; stopping it");
            client.stop().await;
            return Err(ClientsError::ShuttingDown);
        };

        info!(client = %client.id(), pid = client.pid(), %kind, pool_size = size, "Started worker client");
        telemetry::client_spawned();
        Ok(self.reserved(client))
    }

    /// Return a reserved client to the idle set.
    ///
    /// A client stopped while it was reserved is dropped from the pool
    /// instead.
    pub fn release(&self, mut reserved: ReservedClient) -> Result<(), ClientsError> {
        let Some(client) = reserved.client.take() else {
            return Ok(());
        };
        let id = client.id().clone();

        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        let Some(entry) = state.entries.get_mut(&id) else {
            return Err(ClientsError::UnknownClient { id });
        };
        match entry.state {
            ClientState::Reserved => {
                entry.state = ClientState::Idle;
                entry.release_seq = seq;
                entry.last_released = Some(Instant::now());
                state.next_seq += 1;
                debug!(client = %id, "Released worker client");
                Ok(())
            }
            ClientState::Stopped => {
                state.entries.remove(&id);
                debug!(client = %id, "Discarded worker client stopped while reserved");
                Ok(())
            }
            ClientState::Idle => Err(ClientsError::NotReserved { id }),
        }
    }

    /// Remove a reserved client whose process can no longer be trusted and
    /// stop it.
    pub async fn discard(&self, mut reserved: ReservedClient) -> Result<(), ClientsError> {
        let Some(client) = reserved.client.take() else {
            return Ok(());
        };
        let id = client.id().clone();

        let previous = {
            let mut state = self.inner.state.lock();
            match state.entries.get(&id).map(|e| e.state) {
                None => return Err(ClientsError::UnknownClient { id }),
                Some(ClientState::Idle) => return Err(ClientsError::NotReserved { id }),
                Some(previous) => {
                    state.entries.remove(&id);
                    previous
                }
            }
        };

        warn!(client = %id, pid = client.pid(), "Discarding worker client");
        telemetry::client_discarded();
        // A client stopped by `stop_all` has already been shut down.
        if previous == ClientState::Reserved {
            client.stop().await;
        }
        Ok(())
    }

    /// Stop every client, reserved or not, and refuse further reservations.
    ///
    /// Reserved clients stay registered as stopped until their holder
    /// releases them. Calling this again is a no-op.
    pub async fn stop_all(&self) {
        let to_stop: Vec<Arc<WorkerClient>> = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            let mut to_stop = Vec::new();
            state.entries.retain(|_, entry| match entry.state {
                ClientState::Idle => {
                    to_stop.push(Arc::clone(&entry.client));
                    false
                }
                ClientState::Reserved => {
                    entry.state = ClientState::Stopped;
                    to_stop.push(Arc::clone(&entry.client));
                    true
                }
                ClientState::Stopped => true,
            });
            to_stop
        };

        if to_stop.is_empty() {
            return;
        }
        info!(count = to_stop.len(), "Stopping all worker clients");
        join_all(to_stop.iter().map(|client| client.stop())).await;
    }

    /// Offer the idle clients, least recently released first, to `selector`
    /// and stop the ones it picks.
    ///
    /// Selection runs under the pool mutex; stopping happens after it is
    /// released. Returns the stopped clients.
    pub async fn select_idle_clients_to_stop<F>(&self, selector: F) -> Vec<Arc<WorkerClient>>
    where
        F: FnOnce(&[Arc<WorkerClient>]) -> Vec<Arc<WorkerClient>>,
    {
        let selected = {
            let mut state = self.inner.state.lock();
            let idle: Vec<Arc<WorkerClient>> = state
                .idle_lru()
                .into_iter()
                .map(|e| Arc::clone(&e.client))
                .collect();
            let selected = selector(&idle);
            let mut stopped = Vec::with_capacity(selected.len());
            for client in selected {
                let still_idle = state
                    .entries
                    .get(client.id())
                    .is_some_and(|e| e.state == ClientState::Idle);
                if still_idle {
                    state.entries.remove(client.id());
                    stopped.push(client);
                }
            }
            stopped
        };

        join_all(selected.iter().map(|client| client.stop())).await;
        selected
    }

    /// Idle clients, least recently released first.
    pub fn idle_clients(&self) -> Vec<Arc<WorkerClient>> {
        self.inner
            .state
            .lock()
            .idle_lru()
            .into_iter()
            .map(|e| Arc::clone(&e.client))
            .collect()
    }

    /// When `id` was last released, if it is idle.
    pub fn last_released(&self, id: &ClientId) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .entries
            .get(id)
            .and_then(|e| e.last_released)
    }

    /// Current state of `id`, or `None` once it left the pool.
    pub fn state_of(&self, id: &ClientId) -> Option<ClientState> {
        self.inner.state.lock().entries.get(id).map(|e| e.state)
    }

    /// Number of clients registered in the pool.
    pub fn size(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.state == ClientState::Idle)
            .count()
    }

    pub fn reserved_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .entries
            .values()
            .filter(|e| e.state == ClientState::Reserved)
            .count()
    }

    /// Whether [`stop_all`](Self::stop_all) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.state.lock().stopped
    }

    fn reserved(&self, client: Arc<WorkerClient>) -> ReservedClient {
        ReservedClient {
            client: Some(client),
            manager: self.clone(),
        }
    }

    /// Drop a reservation whose holder vanished without releasing it.
    fn abandon(&self, client: Arc<WorkerClient>) {
        let removed = self.inner.state.lock().entries.remove(client.id());
        let needs_stop = removed.is_some_and(|e| e.state == ClientState::Reserved);
        warn!(client = %client.id(), "Reserved worker client abandoned; discarding");
        if !needs_stop {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { client.stop().await });
            }
            // The process is killed when its handle drops.
            Err(_) => drop(client),
        }
    }
}

/// A client reserved for exclusive use by one caller.
///
/// Must be handed back through [`WorkerClientsManager::release`] or
/// [`WorkerClientsManager::discard`]. A reservation dropped without either
/// is discarded.
#[must_use = "a reserved client must be released or discarded"]
pub struct ReservedClient {
    client: Option<Arc<WorkerClient>>,
    manager: WorkerClientsManager,
}

impl ReservedClient {
    fn client(&self) -> Result<&Arc<WorkerClient>, ProtocolError> {
        self.client.as_ref().ok_or(ProtocolError::Exited)
    }

    pub fn id(&self) -> Option<&ClientId> {
        self.client.as_ref().map(|c| c.id())
    }

    pub fn pid(&self) -> Option<u32> {
        self.client.as_ref().and_then(|c| c.pid())
    }

    /// Run `item` on the reserved worker.
    pub async fn execute(
        &self,
        kind: &WorkerKind,
        item: &WorkItem,
    ) -> Result<WorkResult, ProtocolError> {
        self.client()?.execute(kind, item).await
    }
}

impl Drop for ReservedClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.manager.abandon(client);
        }
    }
}

impl fmt::Debug for ReservedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservedClient")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

/// Errors from the worker client pool.
#[derive(Debug, thiserror::Error)]
pub enum ClientsError {
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Startup(#[from] LaunchError),

    #[error("Worker client {id} is not registered with this pool")]
    UnknownClient { id: ClientId },

    #[error("Worker client {id} is not reserved")]
    NotReserved { id: ClientId },
}

impl ClientsError {
    /// Whether this error is a broken reserve/release contract.
    pub const fn is_bookkeeping_violation(&self) -> bool {
        matches!(self, Self::UnknownClient { .. } | Self::NotReserved { .. })
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::FakeLauncher;
    use std::path::PathBuf;

    fn config(executable: &str) -> ProcessConfiguration {
        ProcessConfiguration::new(executable)
    }

    fn kind() -> WorkerKind {
        WorkerKind::new("test")
    }

    fn dir() -> PathBuf {
        std::env::temp_dir()
    }

    async fn spawn(manager: &WorkerClientsManager, executable: &str) -> ReservedClient {
        manager
            .reserve_new_client(&kind(), &dir(), &config(executable))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn new_client_is_reserved() {
        let launcher = FakeLauncher::new();
        let manager = WorkerClientsManager::new(launcher.clone());
        let client = spawn(&manager, "w").await;
        let id = client.id().unwrap().clone();

        assert_eq!(manager.state_of(&id), Some(ClientState::Reserved));
        assert_eq!(launcher.launched(), 1);
        assert!(manager.reserve_idle_client(&config("w")).unwrap().is_none());

        manager.release(client).unwrap();
        assert_eq!(manager.state_of(&id), Some(ClientState::Idle));
        assert!(manager.last_released(&id).is_some());
    }

    #[tokio::test]
    async fn released_client_is_reused() {
        let launcher = FakeLauncher::new();
        let manager = WorkerClientsManager::new(launcher.clone());
        let client = spawn(&manager, "w").await;
        let id = client.id().unwrap().clone();
        manager.release(client).unwrap();

        let again = manager.reserve_idle_client(&config("w")).unwrap().unwrap();
        assert_eq!(again.id(), Some(&id));
        assert_eq!(launcher.launched(), 1);
        assert_eq!(manager.size(), 1);
        manager.release(again).unwrap();
    }

    #[tokio::test]
    async fn most_recently_released_is_reserved_first() {
        let manager = WorkerClientsManager::new(FakeLauncher::new());
        let older = spawn(&manager, "w").await;
        let newer = spawn(&manager, "w").await;
        let older_id = older.id().unwrap().clone();
        let newer_id = newer.id().unwrap().clone();

        manager.release(older).unwrap();
        manager.release(newer).unwrap();

        let picked = manager.reserve_idle_client(&config("w")).unwrap().unwrap();
        assert_eq!(picked.id(), Some(&newer_id));
        assert_eq!(manager.idle_clients()[0].id(), &older_id);
        manager.release(picked).unwrap();
    }

    #[tokio::test]
    async fn incompatible_idle_client_is_skipped() {
        let manager = WorkerClientsManager::new(FakeLauncher::new());
        let client = spawn(&manager, "w1").await;
        manager.release(client).unwrap();

        assert!(manager.reserve_idle_client(&config("w2")).unwrap().is_none());
    }

    #[tokio::test]
    async fn startup_failure_propagates_without_registering() {
        let launcher = FakeLauncher::new();
        launcher.fail_next_launch();
        let manager = WorkerClientsManager::new(launcher);

        let err = manager
            .reserve_new_client(&kind(), &dir(), &config("w"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientsError::Startup(_)));
        assert_eq!(manager.size(), 0);
    }

    #[tokio::test]
    async fn release_of_foreign_client_is_a_violation() {
        let ours = WorkerClientsManager::new(FakeLauncher::new());
        let theirs = WorkerClientsManager::new(FakeLauncher::new());
        let foreign = spawn(&theirs, "w").await;

        let err = ours.release(foreign).unwrap_err();
        assert!(err.is_bookkeeping_violation());
    }

    #[tokio::test]
    async fn discard_stops_the_process() {
        let launcher = FakeLauncher::new();
        let manager = WorkerClientsManager::new(launcher.clone());
        let client = spawn(&manager, "w").await;
        let id = client.id().unwrap().clone();

        manager.discard(client).await.unwrap();
        assert_eq!(manager.state_of(&id), None);
        assert_eq!(launcher.stopped(), 1);
    }

    #[tokio::test]
    async fn stop_all_stops_everything_and_refuses_new_work() {
        let launcher = FakeLauncher::new();
        let manager = WorkerClientsManager::new(launcher.clone());
        let idle = spawn(&manager, "w").await;
        manager.release(idle).unwrap();
        let busy = spawn(&manager, "w").await;
        let busy_id = busy.id().unwrap().clone();

        manager.stop_all().await;
        assert_eq!(launcher.stopped(), 2);
        assert_eq!(manager.state_of(&busy_id), Some(ClientState::Stopped));
        assert!(matches!(
            manager.reserve_idle_client(&config("w")),
            Err(ClientsError::ShuttingDown)
        ));
        assert!(matches!(
            manager.reserve_new_client(&kind(), &dir(), &config("w")).await,
            Err(ClientsError::ShuttingDown)
        ));
        assert_eq!(launcher.launched(), 2);

        // The holder's release discards the stopped client.
        manager.release(busy).unwrap();
        assert_eq!(manager.size(), 0);

        manager.stop_all().await;
        assert_eq!(launcher.stopped(), 2);
    }

    #[tokio::test]
    async fn selector_sees_lru_order_and_never_reserved_clients() {
        let launcher = FakeLauncher::new();
        let manager = WorkerClientsManager::new(launcher.clone());
        let a = spawn(&manager, "w").await;
        let b = spawn(&manager, "w").await;
        let busy = spawn(&manager, "w").await;
        let a_id = a.id().unwrap().clone();
        let b_id = b.id().unwrap().clone();
        manager.release(a).unwrap();
        manager.release(b).unwrap();

        let stopped = manager
            .select_idle_clients_to_stop(|idle| {
                let ids: Vec<_> = idle.iter().map(|c| c.id().clone()).collect();
                assert_eq!(ids, vec![a_id.clone(), b_id.clone()]);
                idle.iter().take(1).cloned().collect()
            })
            .await;

        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].id(), &a_id);
        assert_eq!(manager.state_of(&a_id), None);
        assert_eq!(manager.state_of(&b_id), Some(ClientState::Idle));
        assert_eq!(manager.reserved_count(), 1);
        manager.release(busy).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn eviction_never_stops_a_reserved_client() {
        let launcher = FakeLauncher::new();
        let manager = WorkerClientsManager::new(launcher.clone());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let evictor = {
            let manager = manager.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut evicted = 0;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    evicted += manager
                        .select_idle_clients_to_stop(<[Arc<WorkerClient>]>::to_vec)
                        .await
                        .len();
                    tokio::task::yield_now().await;
                }
                evicted
            })
        };

        let users: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let echo = WorkItem::new("echo", "echo", serde_json::json!(1));
                    for _ in 0..200 {
                        let client = match manager.reserve_idle_client(&config("w")).unwrap() {
                            Some(client) => client,
                            None => spawn(&manager, "w").await,
                        };
                        let result = client.execute(&kind(), &echo).await;
                        assert!(
                            matches!(result, Ok(ref r) if r.is_success()),
                            "reserved client was stopped underneath its holder: {result:?}"
                        );
                        manager.release(client).unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for user in users {
            user.await.unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        let evicted = evictor.await.unwrap();

        assert_eq!(manager.reserved_count(), 0);
        assert_eq!(launcher.stopped(), evicted);
        assert_eq!(launcher.launched(), evicted + manager.size());
    }

    #[tokio::test]
    async fn dropped_reservation_is_discarded() {
        let launcher = FakeLauncher::new();
        let manager = WorkerClientsManager::new(launcher.clone());
        let client = spawn(&manager, "w").await;
        drop(client);

        assert_eq!(manager.size(), 0);
        // The stop runs on a spawned task.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(launcher.stopped(), 1);
    }
}
