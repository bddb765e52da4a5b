//! # Reclamation Tests
//!
//! Each test uses a private `TaskDirectory` so sweeps don't see tasks from
//! other tests running in the same binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gole::{
    current_id, LocalStorage, ReclaimPolicy, Reclaimer, TaskBuilder, TaskDirectory, TaskId,
    TaskState, TlsConfig,
};
use tokio_util::sync::CancellationToken;

fn reclaimer(dir: &Arc<TaskDirectory>, policy: ReclaimPolicy) -> Reclaimer {
    let config = TlsConfig {
        policy,
        ..TlsConfig::default()
    };
    Reclaimer::with_directory(Arc::clone(dir), config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sweep_removes_finished_across_handles() {
    let dir = Arc::new(TaskDirectory::new());
    let reclaimer = reclaimer(&dir, ReclaimPolicy::Conservative);
    let names = LocalStorage::<String>::named("names");
    let counts = LocalStorage::<u64>::named("counts");
    reclaimer.watch(&names);
    reclaimer.watch(&counts);

    // Five tasks that finish, three that stay alive.
    let mut finished = Vec::new();
    for i in 0..5u64 {
        let (n, c) = (names.clone(), counts.clone());
        let id = TaskBuilder::new()
            .directory(Arc::clone(&dir))
            .spawn(async move {
                n.set(format!("done-{i}"));
                c.set(i);
                current_id()
            })
            .await
            .unwrap();
        finished.push(id);
    }

    let release = CancellationToken::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<TaskId>(3);
    let mut running = Vec::new();
    for i in 0..3u64 {
        let (n, c) = (names.clone(), counts.clone());
        let (tx, release) = (tx.clone(), release.clone());
        running.push(
            TaskBuilder::new()
                .directory(Arc::clone(&dir))
                .spawn(async move {
                    n.set(format!("live-{i}"));
                    c.set(100 + i);
                    tx.send(current_id()).await.unwrap();
                    release.cancelled().await;
                    (n.get(), c.get())
                }),
        );
    }
    drop(tx);
    let mut live = Vec::new();
    while let Some(id) = rx.recv().await {
        live.push(id);
    }

    for id in &finished {
        assert_eq!(dir.state(*id), TaskState::Exited);
    }

    let report = reclaimer.sweep();
    assert_eq!(report.handles, 2);
    assert_eq!(report.scanned, 16);
    assert_eq!(report.removed, 10);

    for id in &finished {
        assert!(!names.contains_task(*id));
        assert!(!counts.contains_task(*id));
    }
    for id in &live {
        assert!(names.contains_task(*id));
        assert!(counts.contains_task(*id));
    }

    release.cancel();
    for (i, handle) in running.into_iter().enumerate() {
        let (n, c) = handle.await.unwrap();
        assert_eq!(n, Some(format!("live-{i}")));
        assert_eq!(c, Some(100 + i as u64));
    }

    // The live tasks have now finished too.
    assert_eq!(reclaimer.sweep().removed, 6);
    assert!(names.is_empty());
    assert!(counts.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_never_touch_live_tasks() {
    let dir = Arc::new(TaskDirectory::new());
    let reclaimer = Arc::new(reclaimer(&dir, ReclaimPolicy::Strict));
    let h = LocalStorage::<usize>::new();
    reclaimer.watch(&h);

    let stop = Arc::new(AtomicBool::new(false));
    let sweeper = {
        let reclaimer = Arc::clone(&reclaimer);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut passes = 0;
            while !stop.load(Ordering::Relaxed) {
                reclaimer.sweep();
                passes += 1;
                tokio::task::yield_now().await;
            }
            passes
        })
    };

    let workers: Vec<_> = (0..32)
        .map(|i| {
            let h = h.clone();
            TaskBuilder::new()
                .directory(Arc::clone(&dir))
                .spawn(async move {
                    for round in 0..200 {
                        let value = i * 1_000 + round;
                        h.set(value);
                        tokio::task::yield_now().await;
                        assert_eq!(h.get(), Some(value), "live entry was reclaimed");
                    }
                })
        })
        .collect();

    for worker in workers {
        worker.await.unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    assert!(sweeper.await.unwrap() > 0);

    reclaimer.sweep();
    assert!(h.is_empty());
}

#[tokio::test]
async fn test_conservative_leaves_untracked_tasks_alone() {
    let dir = Arc::new(TaskDirectory::new());
    let reclaimer = reclaimer(&dir, ReclaimPolicy::Conservative);
    let h = LocalStorage::<u8>::new();
    reclaimer.watch(&h);

    let plain = h.clone();
    tokio::spawn(async move { plain.set(1) }).await.unwrap();

    let report = reclaimer.sweep();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.removed, 0);
    assert_eq!(h.len(), 1);
}

#[tokio::test]
async fn test_exit_records_pruned_after_retention() {
    let dir = Arc::new(TaskDirectory::new());
    let config = TlsConfig {
        exit_retention_ms: 1,
        ..TlsConfig::default()
    };
    let reclaimer = Reclaimer::with_directory(Arc::clone(&dir), config);

    let id = TaskBuilder::new()
        .directory(Arc::clone(&dir))
        .spawn(async { current_id() })
        .await
        .unwrap();
    assert_eq!(dir.state(id), TaskState::Exited);

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(reclaimer.sweep().pruned, 1);
    assert_eq!(dir.state(id), TaskState::Unknown);
}

#[tokio::test]
async fn test_aborted_task_is_reclaimed() {
    let dir = Arc::new(TaskDirectory::new());
    let reclaimer = reclaimer(&dir, ReclaimPolicy::Conservative);
    let h = LocalStorage::<u8>::new();
    reclaimer.watch(&h);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let task = {
        let h = h.clone();
        TaskBuilder::new()
            .directory(Arc::clone(&dir))
            .spawn(async move {
                h.set(9);
                tx.send(current_id()).unwrap();
                std::future::pending::<()>().await;
            })
    };
    let id = rx.await.unwrap();
    assert_eq!(dir.state(id), TaskState::Live);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(dir.state(id), TaskState::Exited);

    assert_eq!(reclaimer.sweep().removed, 1);
    assert!(h.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_directory_bounded_without_reclaimer() {
    let dir = Arc::new(TaskDirectory::new());

    for _ in 0..5000 {
        TaskBuilder::new()
            .directory(Arc::clone(&dir))
            .spawn(async { current_id() })
            .await
            .unwrap();
    }
    assert!(dir.is_empty(), "{dir:?}");

    // Attaching a reclaimer keeps exits visible until a sweep prunes them;
    // dropping it goes back to forgetting them.
    let attached = reclaimer(&dir, ReclaimPolicy::Conservative);
    let id = TaskBuilder::new()
        .directory(Arc::clone(&dir))
        .spawn(async { current_id() })
        .await
        .unwrap();
    assert_eq!(dir.state(id), TaskState::Exited);

    drop(attached);
    assert!(!dir.keeps_exit_records());
    TaskBuilder::new()
        .directory(Arc::clone(&dir))
        .spawn(async {})
        .await
        .unwrap();
    assert_eq!(dir.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unwatched_handle_is_reclaimed() {
    let dir = Arc::new(TaskDirectory::new());
    let reclaimer = reclaimer(&dir, ReclaimPolicy::Conservative).covering_all_handles();
    let watched = LocalStorage::<u32>::named("watched");
    let unwatched = LocalStorage::<u32>::named("unwatched");
    reclaimer.watch(&watched);

    for i in 0..10u32 {
        let (w, u) = (watched.clone(), unwatched.clone());
        TaskBuilder::new()
            .directory(Arc::clone(&dir))
            .spawn(async move {
                w.set(i);
                u.set(i);
            })
            .await
            .unwrap();
    }
    assert_eq!(unwatched.len(), 10);

    // Other tests' handles are swept too, but their tasks live in other
    // directories, so only these twenty entries qualify.
    let report = reclaimer.sweep();
    assert_eq!(report.removed, 20);
    assert!(watched.is_empty());
    assert!(unwatched.is_empty());
}
