//! Live task directory
//!
//! Tokio has no stable way to list the tasks of a runtime, so the directory
//! records the tasks spawned through this crate instead. A record is created
//! inside the child before its body runs and is marked exited when the task's
//! future is dropped, whether it completed, panicked or was aborted.
//!
//! Tasks created with plain `tokio::spawn` never appear here and report
//! [`TaskState::Unknown`].
//!
//! Exit records only matter to a [`crate::Reclaimer`]. While none is attached
//! to a directory, a finishing task removes its own record. Otherwise the
//! record stays until a sweep prunes it, and every `PRUNE_EVERY`th entry also
//! drops records older than the directory's retention, so a reclaimer that
//! never sweeps can't grow the map without bound either.

use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::trace;

use crate::ident::TaskId;

/// Process-wide directory used by [`crate::spawn`] and friends
static GLOBAL: Lazy<Arc<TaskDirectory>> = Lazy::new(|| Arc::new(TaskDirectory::new()));

/// Entries between two amortized prunes of old exit records
pub const PRUNE_EVERY: usize = 256;

/// Default age after which an exit record may be pruned on entry
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);

/// What the directory knows about a task id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned through this crate and still running
    Live,
    /// Spawned through this crate and since finished
    Exited,
    /// Never recorded, or the exit record was already pruned
    Unknown,
}

/// Directory record for one task
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Option<Arc<str>>,
    /// Task that spawned this one, if it was spawned from inside a task
    pub parent: Option<TaskId>,
    pub started: Instant,
    pub exited: Option<Instant>,
}

impl TaskInfo {
    pub fn is_live(&self) -> bool {
        self.exited.is_none()
    }
}

/// Point-in-time view of the directory
///
/// Racy by nature: a task can exit, or a new one start, right after the
/// snapshot is taken.
#[derive(Debug, Clone, Default)]
pub struct LiveSet {
    live: HashSet<TaskId>,
    exited: HashSet<TaskId>,
}

impl LiveSet {
    pub fn is_live(&self, id: TaskId) -> bool {
        self.live.contains(&id)
    }

    pub fn has_exited(&self, id: TaskId) -> bool {
        self.exited.contains(&id)
    }

    pub fn live(&self) -> &HashSet<TaskId> {
        &self.live
    }

    pub fn into_live(self) -> HashSet<TaskId> {
        self.live
    }
}

/// Concurrent record of tasks spawned through this crate
pub struct TaskDirectory {
    tasks: DashMap<TaskId, TaskInfo>,
    retention: Duration,
    entered: AtomicUsize,
    reclaimers: AtomicUsize,
}

impl Default for TaskDirectory {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl TaskDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory whose amortized prune drops exit records older than
    /// `retention`
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            retention,
            entered: AtomicUsize::new(0),
            reclaimers: AtomicUsize::new(0),
        }
    }

    /// The process-wide directory
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Record `id` as live until the returned guard is dropped
    pub(crate) fn enter(
        self: &Arc<Self>,
        id: TaskId,
        name: Option<Arc<str>>,
        parent: Option<TaskId>,
    ) -> TaskGuard {
        if self.entered.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            let pruned = self.prune_exited(self.retention);
            if pruned > 0 {
                trace!(pruned, "pruned exit records on entry");
            }
        }
        self.tasks.insert(
            id,
            TaskInfo {
                id,
                name,
                parent,
                started: Instant::now(),
                exited: None,
            },
        );
        TaskGuard {
            directory: Arc::clone(self),
            id,
        }
    }

    pub fn state(&self, id: TaskId) -> TaskState {
        match self.tasks.get(&id) {
            Some(info) if info.is_live() => TaskState::Live,
            Some(_) => TaskState::Exited,
            None => TaskState::Unknown,
        }
    }

    pub fn info(&self, id: TaskId) -> Option<TaskInfo> {
        self.tasks.get(&id).map(|r| r.clone())
    }

    /// Ids of every live task recorded here at the time of the call
    ///
    /// Only tasks started through [`crate::spawn`], [`crate::spawn_with_storage`]
    /// or [`crate::TaskBuilder`] are recorded. A task created with plain
    /// `tokio::spawn` is missing even while it runs, and
    /// [`TaskDirectory::state`] reports it [`TaskState::Unknown`].
    pub fn all_ids(&self) -> HashSet<TaskId> {
        self.snapshot().into_live()
    }

    /// Live and exited ids in one pass
    pub fn snapshot(&self) -> LiveSet {
        let mut set = LiveSet::default();
        for entry in self.tasks.iter() {
            if entry.is_live() {
                set.live.insert(*entry.key());
            } else {
                set.exited.insert(*entry.key());
            }
        }
        set
    }

    pub fn live_count(&self) -> usize {
        self.tasks.iter().filter(|e| e.is_live()).count()
    }

    /// Records held, live and exited
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether exits are kept as records for a reclaimer to see
    pub fn keeps_exit_records(&self) -> bool {
        self.reclaimers.load(Ordering::Acquire) > 0
    }

    pub(crate) fn attach_reclaimer(&self) {
        self.reclaimers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach_reclaimer(&self) {
        self.reclaimers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drop exit records older than `retention`; returns how many went
    pub fn prune_exited(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut pruned = 0;
        self.tasks.retain(|_, info| match info.exited {
            Some(at) if now.saturating_duration_since(at) >= retention => {
                pruned += 1;
                false
            }
            _ => true,
        });
        pruned
    }

    /// Human-readable listing, one task per line, ordered by id
    pub fn dump(&self) -> String {
        let mut tasks: Vec<TaskInfo> = self.tasks.iter().map(|r| r.clone()).collect();
        tasks.sort_by_key(|t| t.id);

        let now = Instant::now();
        let mut out = String::new();
        for t in &tasks {
            let _ = match t.exited {
                None => write!(
                    out,
                    "task {} [live {:.3}s]",
                    t.id,
                    now.saturating_duration_since(t.started).as_secs_f64()
                ),
                Some(at) => write!(
                    out,
                    "task {} [exited {:.3}s ago]",
                    t.id,
                    now.saturating_duration_since(at).as_secs_f64()
                ),
            };
            if let Some(name) = &t.name {
                let _ = write!(out, " name={name}");
            }
            if let Some(parent) = t.parent {
                let _ = write!(out, " parent={parent}");
            }
            out.push('\n');
        }
        out
    }
}

impl fmt::Debug for TaskDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDirectory")
            .field("records", &self.tasks.len())
            .field("live", &self.live_count())
            .field("reclaimers", &self.reclaimers.load(Ordering::Relaxed))
            .finish()
    }
}

/// Marks its task exited on drop, or forgets it when no reclaimer is
/// attached
pub(crate) struct TaskGuard {
    directory: Arc<TaskDirectory>,
    id: TaskId,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.directory.keeps_exit_records() {
            self.directory.tasks.remove(&self.id);
            return;
        }
        if let Some(mut info) = self.directory.tasks.get_mut(&self.id) {
            info.exited = Some(Instant::now());
        }
    }
}
