//! Task identity resolution
//!
//! Two ways to answer "which task is running right now":
//!
//! - **Fast path** ([`current_id`]): reads the runtime's task id and keeps a
//!   per-thread memo of the last resolved pair, so repeated calls from the
//!   same task cost one thread-local read and an id comparison.
//! - **Reference path** ([`reference_id`]): renders the runtime's full textual
//!   description of the task id and parses it with a strict pattern. Slow,
//!   but independent of the memo, which makes it the oracle the fast path is
//!   checked against.
//!
//! Neither path ever synthesizes an id. Outside a task, or when a rendering
//! does not have the expected shape, the call fails.

use std::cell::Cell;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task;

use crate::error::{Result, TlsError};

/// Shape of `tokio::task::Id`'s `Debug` rendering, e.g. `Id(42)`.
static TASK_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Id\(([1-9][0-9]*)\)$").expect("task header pattern is valid"));

thread_local! {
    /// Last (runtime id, resolved id) pair seen on this worker thread
    static LAST_SEEN: Cell<Option<(task::Id, TaskId)>> = const { Cell::new(None) };
}

/// Identifier of a live task, unique among tasks alive at the same time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Raw numeric value
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Convert a runtime id through its numeric `Display` rendering
    fn from_runtime(id: task::Id) -> Result<Self> {
        let text = id.to_string();
        match text.parse::<u64>() {
            Ok(0) => Err(TlsError::identity_parse(text, "task id is zero")),
            Ok(n) => Ok(Self(n)),
            Err(e) => Err(TlsError::identity_parse(text, e.to_string())),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Fast path: identity of the current task, or an error outside a task
pub fn try_current_id() -> Result<TaskId> {
    let id = task::try_id().ok_or(TlsError::OutsideTask)?;

    if let Some((seen, resolved)) = LAST_SEEN.with(Cell::get) {
        if seen == id {
            return Ok(resolved);
        }
    }

    let resolved = TaskId::from_runtime(id).inspect_err(|e| {
        tracing::error!(error = %e, "task id rendering did not parse");
    })?;
    LAST_SEEN.with(|memo| memo.set(Some((id, resolved))));
    Ok(resolved)
}

/// Fast path: identity of the current task
///
/// # Panics
///
/// Panics when called outside a tokio task, or if the runtime's id rendering
/// stops being numeric. A wrong id would alias unrelated tasks in storage, so
/// there is no fallback.
#[inline]
pub fn current_id() -> TaskId {
    match try_current_id() {
        Ok(id) => id,
        Err(e) => panic!("gole: cannot resolve current task: {e}"),
    }
}

/// Reference path: identity of the current task from its textual description
pub fn reference_id() -> Result<TaskId> {
    let id = task::try_id().ok_or(TlsError::OutsideTask)?;
    parse_task_header(&format!("{id:?}"))
}

/// Parse a task description of the form `Id(<n>)`
///
/// Never panics. Anything else, including zero, leading zeros or a value
/// that does not fit in `u64`, is an [`TlsError::IdentityParse`].
pub fn parse_task_header(text: &str) -> Result<TaskId> {
    let caps = TASK_HEADER
        .captures(text.trim())
        .ok_or_else(|| TlsError::identity_parse(text, "expected `Id(<number>)`"))?;

    caps[1]
        .parse()
        .map(TaskId)
        .map_err(|e: std::num::ParseIntError| TlsError::identity_parse(text, e.to_string()))
}

#[cfg(test)]
pub(crate) fn task_id(n: u64) -> TaskId {
    TaskId(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_debug_rendering() {
        assert_eq!(parse_task_header("Id(42)").unwrap().as_u64(), 42);
        assert_eq!(parse_task_header("  Id(7)\n").unwrap().as_u64(), 7);
    }

    #[test]
    fn rejects_foreign_shapes() {
        for text in [
            "",
            "42",
            "Id()",
            "Id(-1)",
            "Id(0)",
            "Id(007)",
            "Id(4x)",
            "goroutine 42 [running]:",
            "Id(99999999999999999999999)",
            "TaskId(3)",
        ] {
            let err = parse_task_header(text).unwrap_err();
            assert!(
                matches!(err, TlsError::IdentityParse { .. }),
                "{text:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn outside_task_is_an_error() {
        assert!(matches!(try_current_id(), Err(TlsError::OutsideTask)));
        assert!(matches!(reference_id(), Err(TlsError::OutsideTask)));
    }

    #[test]
    #[should_panic(expected = "cannot resolve current task")]
    fn current_id_panics_outside_task() {
        current_id();
    }

    #[tokio::test]
    async fn fast_and_reference_agree() {
        let (fast, slow) = tokio::spawn(async { (current_id(), reference_id().unwrap()) })
            .await
            .unwrap();
        assert_eq!(fast, slow);
    }

    #[tokio::test]
    async fn stable_within_a_task() {
        let (a, b) = tokio::spawn(async {
            let a = current_id();
            tokio::task::yield_now().await;
            (a, current_id())
        })
        .await
        .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn memo_does_not_leak_across_tasks() {
        // Both tasks share one thread, so the second must miss the memo.
        let a = tokio::spawn(async { current_id() }).await.unwrap();
        let b = tokio::spawn(async { current_id() }).await.unwrap();
        assert_ne!(a, b);
    }
}
