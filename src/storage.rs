//! Task-local storage handles
//!
//! A [`LocalStorage<T>`] owns a private registry mapping [`TaskId`] to a value.
//! Every access resolves the current task through [`crate::ident::current_id`],
//! so each task only ever sees its own entry. The registry is a sharded
//! `DashMap`: tasks touching different ids never wait on each other.
//!
//! Handles are explicit values, never module-level singletons. Clones share
//! one registry; two calls to [`LocalStorage::new`] never do. Each registry
//! is also listed, by weak reference, in a process-wide index so a
//! [`crate::Reclaimer`] can reach every handle without it being watched.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::Result;
use crate::ident::{self, TaskId};

static NEXT_SLOT: AtomicU64 = AtomicU64::new(1);

/// Every live registry in the process, keyed by slot id
static REGISTRIES: Lazy<DashMap<u64, Weak<dyn Reconcile>>> = Lazy::new(DashMap::new);

/// Registries of every handle still alive
pub(crate) fn registered() -> Vec<Arc<dyn Reconcile>> {
    REGISTRIES.iter().filter_map(|r| r.value().upgrade()).collect()
}

pub(crate) struct Slot<T> {
    id: u64,
    name: Option<Arc<str>>,
    entries: DashMap<TaskId, T>,
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        REGISTRIES.remove(&self.id);
    }
}

/// Handle to one independent task-local slot space
pub struct LocalStorage<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Clone for LocalStorage<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Send + Sync + 'static> Default for LocalStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> LocalStorage<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a handle with a name used in logs and sweep reports
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self::build(Some(name.into()))
    }

    fn build(name: Option<Arc<str>>) -> Self {
        let slot = Arc::new(Slot {
            id: NEXT_SLOT.fetch_add(1, Ordering::Relaxed),
            name,
            entries: DashMap::new(),
        });
        let registry: Weak<dyn Reconcile> = Arc::downgrade(&slot) as Weak<dyn Reconcile>;
        REGISTRIES.insert(slot.id, registry);
        Self { slot }
    }

    pub fn name(&self) -> Option<&str> {
        self.slot.name.as_deref()
    }

    /// Store `value` for the current task, replacing any previous value
    ///
    /// # Panics
    ///
    /// Panics outside a tokio task; see [`LocalStorage::try_set`].
    pub fn set(&self, value: T) {
        self.slot.entries.insert(ident::current_id(), value);
    }

    pub fn try_set(&self, value: T) -> Result<()> {
        self.slot.entries.insert(ident::try_current_id()?, value);
        Ok(())
    }

    /// Borrow the current task's value without cloning it
    ///
    /// The registry shard stays read-locked while `f` runs, so `f` must not
    /// call back into this handle for a write.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slot
            .entries
            .get(&ident::current_id())
            .map(|entry| f(entry.value()))
    }

    /// Remove the current task's value, returning it if there was one
    pub fn del(&self) -> Option<T> {
        self.slot
            .entries
            .remove(&ident::current_id())
            .map(|(_, v)| v)
    }

    pub fn try_del(&self) -> Result<Option<T>> {
        Ok(self
            .slot
            .entries
            .remove(&ident::try_current_id()?)
            .map(|(_, v)| v))
    }

    /// Remove every entry of this handle, for all tasks
    ///
    /// Meant for teardown and shutdown, not per-task cleanup.
    pub fn clear(&self) {
        self.slot.entries.clear();
    }

    /// Number of tasks holding a value in this handle
    pub fn len(&self) -> usize {
        self.slot.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.entries.is_empty()
    }

    pub fn contains_task(&self, id: TaskId) -> bool {
        self.slot.entries.contains_key(&id)
    }

    pub(crate) fn slot(&self) -> &Arc<Slot<T>> {
        &self.slot
    }
}

impl<T: Clone + Send + Sync + 'static> LocalStorage<T> {
    /// Value stored by the current task, if any
    ///
    /// # Panics
    ///
    /// Panics outside a tokio task; see [`LocalStorage::try_get`].
    pub fn get(&self) -> Option<T> {
        self.slot
            .entries
            .get(&ident::current_id())
            .map(|r| r.clone())
    }

    pub fn try_get(&self) -> Result<Option<T>> {
        Ok(self
            .slot
            .entries
            .get(&ident::try_current_id()?)
            .map(|r| r.clone()))
    }
}

impl<T> fmt::Debug for LocalStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStorage")
            .field("slot", &self.slot.id)
            .field("name", &self.slot.name)
            .field("entries", &self.slot.entries.len())
            .finish()
    }
}

/// Value captured from a parent task, restorable under one child id
pub struct Snapshot {
    restore: Box<dyn FnOnce(TaskId) + Send>,
}

impl Snapshot {
    fn new(restore: impl FnOnce(TaskId) + Send + 'static) -> Self {
        Self {
            restore: Box::new(restore),
        }
    }

    pub(crate) fn restore(self, child: TaskId) {
        (self.restore)(child)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Snapshot")
    }
}

/// A storage handle whose values a spawned task can inherit
///
/// Object safe so that handles of different value types can be passed to
/// [`crate::spawn_with_storage`] together.
pub trait Inherit: Send + Sync {
    /// Copy out `parent`'s current value, if it has one
    fn capture(&self, parent: TaskId) -> Option<Snapshot>;
}

impl<T: Clone + Send + Sync + 'static> Inherit for LocalStorage<T> {
    fn capture(&self, parent: TaskId) -> Option<Snapshot> {
        let value = self.slot.entries.get(&parent)?.clone();
        let slot = Arc::clone(&self.slot);
        Some(Snapshot::new(move |child| {
            slot.entries.insert(child, value);
        }))
    }
}

/// Registry surface the reclaimer works against
pub(crate) trait Reconcile: Send + Sync {
    fn slot_id(&self) -> u64;

    fn name(&self) -> Option<&str>;

    fn entry_count(&self) -> usize;

    /// Drop entries whose id fails `keep`; returns how many were dropped
    fn retain_tasks(&self, keep: &mut dyn FnMut(TaskId) -> bool) -> usize;
}

impl<T: Send + Sync + 'static> Reconcile for Slot<T> {
    fn slot_id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn retain_tasks(&self, keep: &mut dyn FnMut(TaskId) -> bool) -> usize {
        let mut removed = 0;
        self.entries.retain(|id, _| {
            let kept = keep(*id);
            if !kept {
                removed += 1;
            }
            kept
        });
        removed
    }
}
