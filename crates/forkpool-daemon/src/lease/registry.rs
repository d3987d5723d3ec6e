//! Semaphore-backed tree of worker leases.
//!
//! The [`LeaseRegistry`] bounds how many work items run in parallel. Every
//! lease hangs off a parent; the root lease holds no permit and stands for a
//! caller that is not itself running as leased work. A child of the root
//! always takes a permit from the registry's semaphore. A child of any other
//! lease borrows its parent's permit when it is the parent's only open child,
//! so a worker dispatching one nested item at a time never waits on itself.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

tokio::task_local! {
    static CURRENT_LEASE: LeaseId;
}

/// Identifier of one lease in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// How a lease occupies concurrency.
enum Slot {
    Root,
    Borrowed,
    Owned(OwnedSemaphorePermit),
}

struct LeaseNode {
    name: String,
    parent: Option<LeaseId>,
    open_children: HashSet<LeaseId>,
    slot: Slot,
    /// Finished by its holder while children were still open; closes with
    /// its last child.
    closing: bool,
}

struct LeaseTable {
    nodes: HashMap<LeaseId, LeaseNode>,
    next_id: u64,
}

impl LeaseTable {
    fn allocate(&mut self) -> LeaseId {
        let id = LeaseId(self.next_id);
        self.next_id += 1;
        id
    }

    fn ensure_open_parent(&self, parent: LeaseId) -> Result<&LeaseNode, LeaseError> {
        self.nodes
            .get(&parent)
            .filter(|node| !node.closing)
            .ok_or(LeaseError::ParentNotOpen { parent })
    }

    fn insert_child(&mut self, parent: LeaseId, name: String, slot: Slot) -> LeaseId {
        let id = self.allocate();
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.open_children.insert(id);
        }
        self.nodes.insert(
            id,
            LeaseNode {
                name,
                parent: Some(parent),
                open_children: HashSet::new(),
                slot,
                closing: false,
            },
        );
        id
    }

    /// Remove `lease`, then every closing ancestor it was the last open
    /// child of.
    fn remove_cascading(&mut self, lease: LeaseId) -> Vec<(LeaseId, LeaseNode)> {
        let mut removed = Vec::new();
        let mut next = Some(lease);
        while let Some(id) = next.take() {
            let Some(node) = self.nodes.remove(&id) else {
                break;
            };
            let parent = node
                .parent
                .and_then(|p| self.nodes.get_mut(&p).map(|parent| (p, parent)));
            if let Some((parent_id, parent)) = parent {
                parent.open_children.remove(&id);
                if parent.closing && parent.open_children.is_empty() {
                    next = Some(parent_id);
                }
            }
            removed.push((id, node));
        }
        removed
    }
}

struct Inner {
    semaphore: Arc<Semaphore>,
    max_permits: usize,
    root: LeaseId,
    table: Mutex<LeaseTable>,
}

/// Registry of hierarchical worker leases.
///
/// Cloning is cheap; clones share the same permits and lease tree.
#[derive(Clone)]
pub struct LeaseRegistry {
    inner: Arc<Inner>,
}

impl LeaseRegistry {
    /// Create a registry with `max_permits` concurrent leases (at least one).
    pub fn new(max_permits: usize) -> Self {
        let max_permits = max_permits.max(1);
        let root = LeaseId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            LeaseNode {
                name: "root".to_string(),
                parent: None,
                open_children: HashSet::new(),
                slot: Slot::Root,
                closing: false,
            },
        );

        info!(max_permits, "LeaseRegistry created");

        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(max_permits)),
                max_permits,
                root,
                table: Mutex::new(LeaseTable { nodes, next_id: 1 }),
            }),
        }
    }

    /// The root lease. It is never released.
    pub fn root(&self) -> LeaseId {
        self.inner.root
    }

    /// Lease bound to the calling task, or the root when none is.
    pub fn current_lease(&self) -> LeaseId {
        CURRENT_LEASE.try_with(|id| *id).unwrap_or(self.inner.root)
    }

    /// Start a child lease of `parent`, waiting for a permit if needed.
    ///
    /// Dropping the returned future while it waits leaves no trace in the
    /// registry.
    pub async fn start_child(
        &self,
        parent: LeaseId,
        name: impl Into<String>,
    ) -> Result<LeaseCompletion, LeaseError> {
        let name = name.into();

        {
            let mut table = self.inner.table.lock();
            let node = table.ensure_open_parent(parent)?;
            let borrow = !matches!(node.slot, Slot::Root) && node.open_children.is_empty();
            if borrow {
                let id = table.insert_child(parent, name, Slot::Borrowed);
                debug!(lease = %id, %parent, "Lease started on parent's permit");
                return Ok(self.completion(id));
            }
        }

        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| LeaseError::Closed)?;

        let mut table = self.inner.table.lock();
        table.ensure_open_parent(parent)?;
        let id = table.insert_child(parent, name, Slot::Owned(permit));
        drop(table);
        debug!(
            lease = %id,
            %parent,
            available = self.inner.semaphore.available_permits(),
            "Lease started"
        );
        Ok(self.completion(id))
    }

    /// Close `lease`.
    ///
    /// Fails when the lease still has open children, was already closed, is
    /// the root, or was never issued by this registry.
    pub fn release(&self, lease: LeaseId) -> Result<(), LeaseError> {
        self.release_lease(lease, false)
    }

    /// Close `lease`. With `defer`, a lease that still has open children is
    /// marked closing and released together with its last child; the
    /// violation is still reported.
    fn release_lease(&self, lease: LeaseId, defer: bool) -> Result<(), LeaseError> {
        let mut table = self.inner.table.lock();
        let Some(node) = table.nodes.get_mut(&lease) else {
            return Err(if lease.0 < table.next_id {
                LeaseError::AlreadyReleased { lease }
            } else {
                LeaseError::Unknown { lease }
            });
        };
        if matches!(node.slot, Slot::Root) {
            return Err(LeaseError::RootLease);
        }
        if !node.open_children.is_empty() {
            let open_children = node.open_children.len();
            if defer && !node.closing {
                node.closing = true;
                debug!(lease = %lease, open_children, "Lease will close with its last child");
            }
            return Err(LeaseError::OpenChildren {
                lease,
                open_children,
            });
        }

        let removed = table.remove_cascading(lease);
        drop(table);

        for (id, node) in removed {
            debug!(lease = %id, name = %node.name, "Lease released");
            // Dropping the slot returns an owned permit to the semaphore.
            drop(node.slot);
        }
        Ok(())
    }

    /// Whether `lease` is currently open.
    pub fn is_open(&self, lease: LeaseId) -> bool {
        self.inner.table.lock().nodes.contains_key(&lease)
    }

    /// Number of open leases, excluding the root.
    pub fn open_leases(&self) -> usize {
        self.inner.table.lock().nodes.len().saturating_sub(1)
    }

    /// Number of permits currently held by open leases.
    pub fn active_permits(&self) -> usize {
        self.inner.max_permits - self.inner.semaphore.available_permits()
    }

    /// Configured permit count.
    pub fn max_permits(&self) -> usize {
        self.inner.max_permits
    }

    /// Fail every pending and future `start_child` with [`LeaseError::Closed`].
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    fn completion(&self, id: LeaseId) -> LeaseCompletion {
        LeaseCompletion {
            id,
            registry: self.clone(),
            finished: false,
        }
    }
}

impl Default for LeaseRegistry {
    fn default() -> Self {
        Self::new(forkpool_core::config::default_max_workers())
    }
}

/// Run `fut` with `lease` as the task's current lease.
pub async fn with_current_lease<F: Future>(lease: LeaseId, fut: F) -> F::Output {
    CURRENT_LEASE.scope(lease, fut).await
}

/// An open lease that must be finished exactly once.
///
/// Dropping an unfinished completion releases the lease and logs any
/// violation, so a panicking or cancelled holder never leaks its permit.
#[must_use = "a lease must be finished to release its permit"]
pub struct LeaseCompletion {
    id: LeaseId,
    registry: LeaseRegistry,
    finished: bool,
}

impl LeaseCompletion {
    pub const fn id(&self) -> LeaseId {
        self.id
    }

    /// Release the lease, reporting bookkeeping violations.
    ///
    /// A lease finished while children are still open reports
    /// [`LeaseError::OpenChildren`] and closes once its last child does.
    pub fn finish(mut self) -> Result<(), LeaseError> {
        self.finished = true;
        self.registry.release_lease(self.id, true)
    }
}

impl Drop for LeaseCompletion {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.registry.release_lease(self.id, true) {
                warn!(lease = %self.id, error = %e, "Failed to release abandoned lease");
            }
        }
    }
}

impl fmt::Debug for LeaseCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseCompletion")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Errors from the lease registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("{lease} still has {open_children} open child lease(s)")]
    OpenChildren { lease: LeaseId, open_children: usize },

    #[error("{lease} was already released")]
    AlreadyReleased { lease: LeaseId },

    #[error("{lease} was not issued by this registry")]
    Unknown { lease: LeaseId },

    #[error("the root lease cannot be released")]
    RootLease,

    #[error("parent {parent} is not open")]
    ParentNotOpen { parent: LeaseId },

    #[error("lease registry has been closed")]
    Closed,
}

impl LeaseError {
    /// Whether this error is a broken acquire/release contract rather than
    /// registry shutdown.
    pub const fn is_bookkeeping_violation(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn zero_permits_become_one() {
        let registry = LeaseRegistry::new(0);
        assert_eq!(registry.max_permits(), 1);
    }

    #[tokio::test]
    async fn child_of_root_takes_a_permit() {
        let registry = LeaseRegistry::new(2);
        let lease = registry.start_child(registry.root(), "a").await.unwrap();
        assert_eq!(registry.active_permits(), 1);
        assert_eq!(registry.open_leases(), 1);

        lease.finish().unwrap();
        assert_eq!(registry.active_permits(), 0);
        assert_eq!(registry.open_leases(), 0);
    }

    #[tokio::test]
    async fn acquisition_waits_for_a_permit() {
        let registry = LeaseRegistry::new(1);
        let first = registry.start_child(registry.root(), "first").await.unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let lease = registry.start_child(registry.root(), "second").await.unwrap();
                lease.finish().unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.finish().unwrap();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("second lease should start once the first is released")
            .unwrap();
    }

    #[tokio::test]
    async fn double_release_is_detected() {
        let registry = LeaseRegistry::new(1);
        let lease = registry.start_child(registry.root(), "a").await.unwrap();
        let id = lease.id();
        lease.finish().unwrap();

        assert_eq!(
            registry.release(id),
            Err(LeaseError::AlreadyReleased { lease: id })
        );
        assert_eq!(registry.active_permits(), 0);
    }

    #[tokio::test]
    async fn release_with_open_children_fails() {
        let registry = LeaseRegistry::new(2);
        let parent = registry.start_child(registry.root(), "parent").await.unwrap();
        let child = registry.start_child(parent.id(), "child").await.unwrap();

        let err = registry.release(parent.id()).unwrap_err();
        assert_eq!(
            err,
            LeaseError::OpenChildren {
                lease: parent.id(),
                open_children: 1
            }
        );
        assert!(err.is_bookkeeping_violation());
        assert!(registry.is_open(parent.id()));

        child.finish().unwrap();
        parent.finish().unwrap();
    }

    #[tokio::test]
    async fn finishing_with_open_children_closes_with_the_last_child() {
        let registry = LeaseRegistry::new(3);
        let parent = registry.start_child(registry.root(), "parent").await.unwrap();
        let parent_id = parent.id();
        let borrowed = registry.start_child(parent_id, "borrowed").await.unwrap();
        let owned = registry.start_child(parent_id, "owned").await.unwrap();
        assert_eq!(registry.active_permits(), 2);

        let err = parent.finish().unwrap_err();
        assert_eq!(
            err,
            LeaseError::OpenChildren {
                lease: parent_id,
                open_children: 2
            }
        );
        assert!(registry.is_open(parent_id));
        assert_eq!(
            registry.start_child(parent_id, "late").await.unwrap_err(),
            LeaseError::ParentNotOpen { parent: parent_id }
        );

        owned.finish().unwrap();
        assert!(registry.is_open(parent_id));
        assert_eq!(registry.active_permits(), 1);

        borrowed.finish().unwrap();
        assert!(!registry.is_open(parent_id));
        assert_eq!(registry.open_leases(), 0);
        assert_eq!(registry.active_permits(), 0);
    }

    #[tokio::test]
    async fn dropped_parent_with_open_child_closes_with_it() {
        let registry = LeaseRegistry::new(1);
        let parent = registry.start_child(registry.root(), "parent").await.unwrap();
        let child = registry.start_child(parent.id(), "child").await.unwrap();

        drop(parent);
        assert_eq!(registry.open_leases(), 2);

        drop(child);
        assert_eq!(registry.open_leases(), 0);
        assert_eq!(registry.active_permits(), 0);
    }

    #[tokio::test]
    async fn release_without_acquire_fails() {
        let registry = LeaseRegistry::new(1);
        let other = LeaseRegistry::new(1);
        for _ in 0..3 {
            let lease = other.start_child(other.root(), "x").await.unwrap();
            lease.finish().unwrap();
        }
        let foreign = other.start_child(other.root(), "y").await.unwrap();

        assert_eq!(
            registry.release(foreign.id()),
            Err(LeaseError::Unknown { lease: foreign.id() })
        );
        assert_eq!(registry.release(registry.root()), Err(LeaseError::RootLease));
        foreign.finish().unwrap();
    }

    #[tokio::test]
    async fn only_child_borrows_parent_permit() {
        let registry = LeaseRegistry::new(1);
        let parent = registry.start_child(registry.root(), "parent").await.unwrap();

        let child = tokio::time::timeout(
            Duration::from_millis(100),
            registry.start_child(parent.id(), "nested"),
        )
        .await
        .expect("nested lease must not wait on its own parent")
        .unwrap();
        assert_eq!(registry.active_permits(), 1);

        // A second concurrent child needs a fresh permit.
        let second = tokio::time::timeout(
            Duration::from_millis(20),
            registry.start_child(parent.id(), "nested-2"),
        )
        .await;
        assert!(second.is_err());

        child.finish().unwrap();
        parent.finish().unwrap();
        assert_eq!(registry.active_permits(), 0);
    }

    #[tokio::test]
    async fn child_of_closed_parent_is_rejected() {
        let registry = LeaseRegistry::new(2);
        let parent = registry.start_child(registry.root(), "p").await.unwrap();
        let id = parent.id();
        parent.finish().unwrap();

        let err = registry.start_child(id, "orphan").await.unwrap_err();
        assert_eq!(err, LeaseError::ParentNotOpen { parent: id });
    }

    #[tokio::test]
    async fn dropped_completion_releases() {
        let registry = LeaseRegistry::new(1);
        {
            let _lease = registry.start_child(registry.root(), "dropped").await.unwrap();
            assert_eq!(registry.active_permits(), 1);
        }
        assert_eq!(registry.active_permits(), 0);
        assert_eq!(registry.open_leases(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquisition_leaves_nothing_behind() {
        let registry = LeaseRegistry::new(1);
        let held = registry.start_child(registry.root(), "held").await.unwrap();

        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            registry.start_child(registry.root(), "cancelled"),
        )
        .await;
        assert!(pending.is_err());
        assert_eq!(registry.open_leases(), 1);

        held.finish().unwrap();
        assert_eq!(registry.active_permits(), 0);
    }

    #[tokio::test]
    async fn closed_registry_fails_waiters() {
        let registry = LeaseRegistry::new(1);
        let held = registry.start_child(registry.root(), "held").await.unwrap();
        registry.close();

        let err = registry.start_child(registry.root(), "late").await.unwrap_err();
        assert_eq!(err, LeaseError::Closed);
        assert!(!err.is_bookkeeping_violation());
        held.finish().unwrap();
    }

    #[tokio::test]
    async fn current_lease_follows_scope() {
        let registry = LeaseRegistry::new(1);
        assert_eq!(registry.current_lease(), registry.root());

        let lease = registry.start_child(registry.root(), "scoped").await.unwrap();
        let id = lease.id();
        let seen = with_current_lease(id, async { registry.current_lease() }).await;
        assert_eq!(seen, id);
        assert_eq!(registry.current_lease(), registry.root());
        lease.finish().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_leases_never_exceed_permits() {
        const PERMITS: usize = 3;
        let registry = LeaseRegistry::new(PERMITS);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..24 {
            let registry = registry.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let lease = registry
                    .start_child(registry.root(), format!("item-{i}"))
                    .await
                    .unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(registry.active_permits() <= PERMITS);
                tokio::time::sleep(Duration::from_millis(2)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                lease.finish().unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= PERMITS);
        assert_eq!(registry.active_permits(), 0);
        assert_eq!(registry.open_leases(), 0);
    }
}
