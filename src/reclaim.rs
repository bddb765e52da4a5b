//! Stale-entry reclamation
//!
//! Nothing tells a storage handle that a task has finished, so entries for
//! finished tasks pile up until something removes them. The [`Reclaimer`]
//! reconciles handles against the [`TaskDirectory`], either on demand
//! ([`Reclaimer::sweep`]) or on a background interval ([`Reclaimer::start`]).
//! [`Reclaimer::new`] covers every handle in the process; one built with
//! [`Reclaimer::with_directory`] covers only the handles it is told to
//! [`watch`](Reclaimer::watch) until [`Reclaimer::covering_all_handles`].
//!
//! A directory keeps exit records only while a reclaimer is attached to it,
//! so build the reclaimer before spawning the tasks it should clean up after.
//!
//! Reclamation only bounds memory. An entry may outlive its task by up to one
//! sweep interval. It never removes the entry of a task that is live at the
//! moment of removal: every candidate is re-checked against the directory
//! under the registry's shard lock, so a `set` racing with a sweep either
//! lands before the removal and is removed with it, or lands after and stays.
//!
//! Tokio never reuses task ids, so a stale entry can't be picked up by a
//! newer task. On a runtime that did reuse ids, the sweep interval would have
//! to stay well below the reuse delay, and even then this would only be
//! unlikely, not impossible.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ReclaimPolicy, TlsConfig};
use crate::directory::{LiveSet, TaskDirectory, TaskState};
use crate::ident::TaskId;
use crate::storage::{self, LocalStorage, Reconcile};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Handles swept
    pub handles: usize,
    /// Entries looked at across those handles
    pub scanned: usize,
    /// Entries removed as stale
    pub removed: usize,
    /// Exit records dropped from the directory after the pass
    pub pruned: usize,
}

struct Watched {
    slot_id: u64,
    registry: Weak<dyn Reconcile>,
}

/// Which handles a sweep visits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Every handle alive in the process, plus any watched ones
    AllHandles,
    /// Only handles passed to [`Reclaimer::watch`]
    Watched,
}

/// Removes storage entries that belong to finished tasks
pub struct Reclaimer {
    directory: Arc<TaskDirectory>,
    config: TlsConfig,
    scope: Scope,
    watched: Mutex<Vec<Watched>>,
}

impl Reclaimer {
    /// Reclaimer over the global task directory and every storage handle
    pub fn new(config: TlsConfig) -> Self {
        Self::with_directory(TaskDirectory::global(), config).covering_all_handles()
    }

    /// Reclaimer over `directory` that only sweeps watched handles
    pub fn with_directory(directory: Arc<TaskDirectory>, config: TlsConfig) -> Self {
        directory.attach_reclaimer();
        Self {
            directory,
            config,
            scope: Scope::Watched,
            watched: Mutex::new(Vec::new()),
        }
    }

    /// Sweep every handle alive in the process, watched or not
    pub fn covering_all_handles(mut self) -> Self {
        self.scope = Scope::AllHandles;
        self
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Include `storage` in future sweeps
    ///
    /// Only a weak reference is kept: once every clone of the handle is
    /// dropped, it falls out of the watch list on the next sweep. Watching
    /// the same handle twice is a no-op.
    pub fn watch<T: Send + Sync + 'static>(&self, storage: &LocalStorage<T>) {
        let slot = storage.slot();
        let slot_id = slot.slot_id();
        let registry: Weak<dyn Reconcile> = Arc::downgrade(slot) as Weak<dyn Reconcile>;

        let mut watched = self.watched.lock();
        if watched.iter().any(|w| w.slot_id == slot_id) {
            return;
        }
        watched.push(Watched { slot_id, registry });
    }

    /// Number of watched handles that are still alive
    pub fn watched(&self) -> usize {
        self.watched
            .lock()
            .iter()
            .filter(|w| w.registry.strong_count() > 0)
            .count()
    }

    /// Run one reconciliation pass over every handle in scope
    pub fn sweep(&self) -> SweepReport {
        let mut registries: Vec<Arc<dyn Reconcile>> = {
            let mut watched = self.watched.lock();
            watched.retain(|w| w.registry.strong_count() > 0);
            watched.iter().filter_map(|w| w.registry.upgrade()).collect()
        };
        if self.scope == Scope::AllHandles {
            for registry in storage::registered() {
                if !registries.iter().any(|r| r.slot_id() == registry.slot_id()) {
                    registries.push(registry);
                }
            }
        }

        let snapshot = self.directory.snapshot();
        let mut report = SweepReport {
            handles: registries.len(),
            ..SweepReport::default()
        };

        for registry in &registries {
            report.scanned += registry.entry_count();
            let removed = registry.retain_tasks(&mut |id| !self.is_stale(id, &snapshot));
            if removed > 0 {
                debug!(
                    handle = registry.name().unwrap_or("<unnamed>"),
                    removed, "reclaimed stale entries"
                );
            }
            report.removed += removed;
        }

        report.pruned = self.directory.prune_exited(self.config.exit_retention());

        if report.removed > 0 {
            info!(
                handles = report.handles,
                scanned = report.scanned,
                removed = report.removed,
                pruned = report.pruned,
                "sweep finished"
            );
        } else {
            debug!(handles = report.handles, scanned = report.scanned, "sweep finished");
        }
        report
    }

    fn is_stale(&self, id: TaskId, snapshot: &LiveSet) -> bool {
        match self.config.policy {
            ReclaimPolicy::Conservative => {
                snapshot.has_exited(id) && self.directory.state(id) == TaskState::Exited
            }
            ReclaimPolicy::Strict => {
                !snapshot.is_live(id) && self.directory.state(id) != TaskState::Live
            }
        }
    }

    /// Sweep every `sweep_interval` on the current tokio runtime until the
    /// returned handle is shut down
    pub fn start(self: Arc<Self>) -> ReclaimerHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let period = self.config.sweep_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            debug!("reclaimer stopped");
        });

        ReclaimerHandle { token, task }
    }
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer")
            .field("policy", &self.config.policy)
            .field("scope", &self.scope)
            .field("watched", &self.watched())
            .finish()
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.directory.detach_reclaimer();
    }
}

/// Background sweep loop started by [`Reclaimer::start`]
pub struct ReclaimerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Stop the loop and wait for the in-flight sweep, if any
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }

    /// Whether the loop has stopped, by shutdown or by panic
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
