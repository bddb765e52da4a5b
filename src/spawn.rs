//! Task spawning with snapshot-at-spawn inheritance
//!
//! Values are captured synchronously in the spawning task. The child writes
//! them under its own id before its body is first polled, so the body never
//! observes a half-inherited state. After that, parent and child entries are
//! independent.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::trace;

use crate::directory::TaskDirectory;
use crate::error::TlsError;
use crate::ident::{self, TaskId};
use crate::storage::{Inherit, Snapshot};

/// Spawn a tracked task that inherits nothing
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    TaskBuilder::new().spawn(future)
}

/// Spawn a tracked task that starts with a copy of the caller's values in
/// each of `storages`
///
/// Handles where the caller has no value are skipped; the child sees them
/// as absent.
pub fn spawn_with_storage<F>(storages: &[&dyn Inherit], future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    storages
        .iter()
        .fold(TaskBuilder::new(), |b, s| b.inherit(*s))
        .spawn(future)
}

/// Configures a tracked task before spawning it
#[derive(Default)]
pub struct TaskBuilder<'a> {
    name: Option<Arc<str>>,
    directory: Option<Arc<TaskDirectory>>,
    inherit: Vec<&'a dyn Inherit>,
}

impl<'a> TaskBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown in the directory dump
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Record the task in `directory` instead of the global one
    pub fn directory(mut self, directory: Arc<TaskDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Copy the caller's value in `storage` into the child
    pub fn inherit(mut self, storage: &'a dyn Inherit) -> Self {
        self.inherit.push(storage);
        self
    }

    /// Spawn on the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, like `tokio::spawn`, or if
    /// the spawning task's id cannot be resolved.
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let parent = match ident::try_current_id() {
            Ok(id) => Some(id),
            Err(TlsError::OutsideTask) => None,
            Err(e) => panic!("gole: cannot resolve spawning task: {e}"),
        };
        let snapshots = capture_all(parent, &self.inherit);
        let directory = self.directory.unwrap_or_else(TaskDirectory::global);
        let name = self.name;

        tokio::spawn(async move {
            let id = ident::current_id();
            let _guard = directory.enter(id, name, parent);
            let inherited = snapshots.len();
            for snapshot in snapshots {
                snapshot.restore(id);
            }
            trace!(task = %id, parent = ?parent.map(TaskId::as_u64), inherited, "task started");
            future.await
        })
    }
}

fn capture_all(parent: Option<TaskId>, storages: &[&dyn Inherit]) -> Vec<Snapshot> {
    match parent {
        Some(parent) => storages.iter().filter_map(|s| s.capture(parent)).collect(),
        None => {
            if !storages.is_empty() {
                trace!(
                    handles = storages.len(),
                    "spawned from outside a task, nothing to inherit"
                );
            }
            Vec::new()
        }
    }
}
