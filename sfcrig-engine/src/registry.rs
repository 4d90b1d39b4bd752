//! Creation log of every remote resource a run has made.
//!
//! Builders register a resource right after the remote side confirms it, never
//! before, so a failed create leaves nothing behind to clean up. The log is
//! append-only until teardown drains it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

use sfcrig_shared::errors::{ProvisionError, ProvisionResult};
use sfcrig_shared::resource::{RegistryEntry, ResourceHandle, ResourceKind};

#[derive(Debug, Default)]
struct RegistryLog {
    entries: Vec<RegistryEntry>,
    index: HashSet<(ResourceKind, ResourceHandle)>,
    next_order: u64,
}

/// Shared, run-scoped resource registry.
///
/// Clones share one log, so every builder of a run can hold its own handle.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    log: Arc<Mutex<RegistryLog>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a created resource.
    ///
    /// Returns `false` when the same kind and handle are already recorded.
    pub fn register(&self, kind: ResourceKind, handle: ResourceHandle) -> ProvisionResult<bool> {
        if !handle.fits(kind) {
            return Err(ProvisionError::KindHandleMismatch {
                kind,
                handle: handle.to_string(),
            });
        }

        let mut log = self.lock();
        if !log.index.insert((kind, handle.clone())) {
            trace!("{} {} already registered", kind, handle);
            return Ok(false);
        }

        let creation_order = log.next_order;
        log.next_order += 1;
        debug!("Registered {} {} (#{})", kind, handle, creation_order);
        log.entries.push(RegistryEntry {
            kind,
            handle,
            creation_order,
        });
        Ok(true)
    }

    /// Register a standalone object by id
    pub fn register_id(&self, kind: ResourceKind, id: &str) -> ProvisionResult<bool> {
        self.register(kind, ResourceHandle::id(id))
    }

    /// Handles of one kind, in registration order
    pub fn all_of(&self, kind: ResourceKind) -> Vec<ResourceHandle> {
        self.lock()
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Whether an object with this id was created by this run
    pub fn contains(&self, kind: ResourceKind, id: &str) -> bool {
        self.lock()
            .index
            .contains(&(kind, ResourceHandle::id(id)))
    }

    /// Fail with `DanglingReference` unless the object was created by this run
    pub fn require(&self, kind: ResourceKind, id: &str) -> ProvisionResult<()> {
        if self.contains(kind, id) {
            Ok(())
        } else {
            Err(ProvisionError::dangling(kind, id))
        }
    }

    /// Copy of the log in registration order
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Take the whole log, newest first, leaving the registry empty
    pub fn drain(&self) -> Vec<RegistryEntry> {
        let mut log = self.lock();
        log.index.clear();
        let mut entries = std::mem::take(&mut log.entries);
        entries.reverse();
        debug!("Drained {} registry entries", entries.len());
        entries
    }
}
