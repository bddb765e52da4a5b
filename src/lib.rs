//! Gole - task-local storage for tokio tasks
//!
//! Values are keyed by the id of the task that stores them, so each task sees
//! only its own value in a [`LocalStorage`] handle:
//!
//! ```rust,ignore
//! use gole::{spawn_with_storage, LocalStorage};
//!
//! let user = LocalStorage::<String>::new();
//! user.set("alice".into());
//!
//! let child = user.clone();
//! spawn_with_storage(&[&user], async move {
//!     assert_eq!(child.get().as_deref(), Some("alice"));
//! });
//! ```
//!
//! - [`ident`]: which task is running (fast path and reference path)
//! - [`directory`]: live tasks spawned through this crate
//! - [`storage`]: per-handle registries and inheritance snapshots
//! - [`spawn`](mod@spawn): spawning with snapshot-at-spawn inheritance
//! - [`reclaim`]: removing entries left behind by finished tasks

pub mod config;
pub mod directory;
pub mod error;
pub mod ident;
pub mod reclaim;
pub mod spawn;
pub mod storage;

pub use config::{ReclaimPolicy, TlsConfig};
pub use directory::{LiveSet, TaskDirectory, TaskInfo, TaskState};
pub use error::{FixSuggestion, Result, TlsError};
pub use ident::{current_id, reference_id, try_current_id, TaskId};
pub use reclaim::{Reclaimer, ReclaimerHandle, Scope, SweepReport};
pub use spawn::{spawn, spawn_with_storage, TaskBuilder};
pub use storage::{Inherit, LocalStorage, Snapshot};

/// Ids of every live task spawned through this crate
///
/// This is a superset of the live tasks started with [`spawn`],
/// [`spawn_with_storage`] or [`TaskBuilder`] on the global directory, and
/// nothing more. Tokio offers no stable listing of a runtime's tasks, so a
/// task created with plain `tokio::spawn` (or spawned into a private
/// [`TaskDirectory`]) is absent from the result even while it runs. Such a
/// task reports [`TaskState::Unknown`], and the default
/// [`ReclaimPolicy::Conservative`] never reclaims its entries.
pub fn all_ids() -> std::collections::HashSet<TaskId> {
    TaskDirectory::global().all_ids()
}
