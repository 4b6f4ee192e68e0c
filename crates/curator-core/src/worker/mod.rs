//! Worker manager: runs isolated units and terminates them on demand.
//!
//! Each isolated unit runs in its own tokio task and talks to its tracker
//! only through [`WorkerMessage`]s. The manager keeps one handle per task
//! while the unit is alive. Terminating a worker fires the handle's kill
//! signal, which aborts the unit's task and drops its future (subprocess
//! workers are killed on drop).

pub mod command;
pub mod message;

pub use command::{CommandWorker, CommandWorkerFactory};
pub use message::{WORKER_CHANNEL_CAPACITY, WorkerContext, WorkerMessage};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use curator_model::TaskId;

use crate::tracker::TaskTracker;
use crate::unit::IsolatedUnit;

struct WorkerHandle {
    generation: u64,
    kill: CancellationToken,
}

enum WorkerExit {
    Finished(anyhow::Result<()>),
    /// The unit sent `complete` or `fail` and was stopped before the
    /// message was applied.
    Reported(WorkerMessage),
    Panicked(String),
    Terminated,
}

#[derive(Clone, Default)]
pub struct WorkerManager {
    workers: Arc<Mutex<HashMap<TaskId, WorkerHandle>>>,
    generations: Arc<AtomicU64>,
}

impl WorkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `unit` in a worker for `task_id`.
    ///
    /// The handle is registered first, then `on_started` is called (the
    /// caller marks the tracker running there), then the unit is spawned.
    /// If `on_started` returns `false` nothing is spawned. Returns whether
    /// the worker started.
    pub fn run_in_worker(
        &self,
        task_id: TaskId,
        tracker: Arc<TaskTracker>,
        unit: Box<dyn IsolatedUnit>,
        on_started: impl FnOnce() -> bool,
    ) -> bool {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let kill = CancellationToken::new();
        {
            let mut workers = self.workers.lock();
            if workers.contains_key(&task_id) {
                warn!(task_id = %task_id, "worker already running for task");
                return false;
            }
            workers.insert(
                task_id.clone(),
                WorkerHandle {
                    generation,
                    kill: kill.clone(),
                },
            );
        }

        if !on_started() {
            self.remove_handle(&task_id, generation);
            return false;
        }

        debug!(task_id = %task_id, "worker spawned");
        let workers = self.clone();
        tokio::spawn(async move {
            let exit = run_unit(task_id.clone(), &tracker, unit, &kill).await;
            // The handle goes before the terminal update, which frees the
            // admission slot.
            workers.remove_handle(&task_id, generation);
            match exit {
                WorkerExit::Terminated => {
                    debug!(task_id = %task_id, "worker terminated");
                }
                _ if kill.is_cancelled() => {
                    debug!(task_id = %task_id, "worker exited after termination was requested");
                }
                WorkerExit::Reported(message) => {
                    debug!(task_id = %task_id, "worker reported its own outcome");
                    message.apply(&tracker);
                }
                WorkerExit::Finished(Ok(())) => {
                    tracker.complete();
                }
                WorkerExit::Finished(Err(e)) => {
                    warn!(task_id = %task_id, error = %e, "worker failed");
                    tracker.fail(format!("{e:#}"));
                }
                WorkerExit::Panicked(msg) => {
                    error!(task_id = %task_id, panic = %msg, "worker panicked");
                    tracker.fail(format!("worker panicked: {msg}"));
                }
            }
        });
        true
    }

    /// Kill the worker for `task_id`. Returns `false` when no worker is
    /// running for it.
    pub fn terminate_worker(&self, task_id: &str) -> bool {
        let handle = self.workers.lock().remove(task_id);
        match handle {
            Some(handle) => {
                handle.kill.cancel();
                info!(task_id, "worker terminated");
                true
            }
            None => false,
        }
    }

    pub fn is_worker_active(&self, task_id: &str) -> bool {
        self.workers.lock().contains_key(task_id)
    }

    pub fn active_workers(&self) -> Vec<TaskId> {
        self.workers.lock().keys().cloned().collect()
    }

    /// Kill every worker, returning the ids that were running.
    pub fn terminate_all(&self) -> Vec<TaskId> {
        let drained: Vec<(TaskId, WorkerHandle)> = self.workers.lock().drain().collect();
        drained
            .into_iter()
            .map(|(id, handle)| {
                handle.kill.cancel();
                id
            })
            .collect()
    }

    fn remove_handle(&self, task_id: &TaskId, generation: u64) {
        let mut workers = self.workers.lock();
        if workers
            .get(task_id)
            .is_some_and(|h| h.generation == generation)
        {
            workers.remove(task_id);
        }
    }
}

/// Drive one unit to its exit, forwarding its messages to the tracker.
///
/// The unit's result is only awaited once its channel has closed, so every
/// message it sent is applied first. A terminal message stops the unit and
/// is handed back unapplied.
async fn run_unit(
    task_id: TaskId,
    tracker: &TaskTracker,
    unit: Box<dyn IsolatedUnit>,
    kill: &CancellationToken,
) -> WorkerExit {
    let (tx, mut rx) = mpsc::channel::<WorkerMessage>(WORKER_CHANNEL_CAPACITY);
    let ctx = WorkerContext::new(task_id, tx);
    let mut unit_task = tokio::spawn(unit.run(ctx));
    let mut open = true;

    loop {
        tokio::select! {
            biased;
            _ = kill.cancelled() => {
                unit_task.abort();
                return WorkerExit::Terminated;
            }
            message = rx.recv(), if open => match message {
                Some(message) if message.is_terminal() => {
                    unit_task.abort();
                    // Wait for the future to be dropped.
                    let _ = unit_task.await;
                    return WorkerExit::Reported(message);
                }
                Some(message) => message.apply(tracker),
                None => open = false,
            },
            joined = &mut unit_task, if !open => {
                return match joined {
                    Ok(result) => WorkerExit::Finished(result),
                    Err(e) if e.is_panic() => WorkerExit::Panicked(e.to_string()),
                    Err(_) => WorkerExit::Terminated,
                };
            }
        }
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("active", &self.workers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use curator_model::{ProgressDelta, ProgressRecord, TaskKind, TaskStatus};

    struct Probe {
        items: u64,
    }

    #[async_trait]
    impl IsolatedUnit for Probe {
        async fn run(self: Box<Self>, ctx: WorkerContext) -> Result<()> {
            ctx.set_total(self.items).await?;
            for _ in 0..self.items {
                ctx.advance(ProgressDelta::item_succeeded()).await?;
            }
            Ok(())
        }
    }

    struct Hangs;

    #[async_trait]
    impl IsolatedUnit for Hangs {
        async fn run(self: Box<Self>, ctx: WorkerContext) -> Result<()> {
            ctx.advance(ProgressDelta::item_succeeded()).await?;
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct ReportsThenHangs;

    #[async_trait]
    impl IsolatedUnit for ReportsThenHangs {
        async fn run(self: Box<Self>, ctx: WorkerContext) -> Result<()> {
            ctx.advance(ProgressDelta::item_succeeded()).await?;
            ctx.send(WorkerMessage::Complete).await?;
            ctx.advance(ProgressDelta::item_succeeded()).await?;
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct Fails;

    #[async_trait]
    impl IsolatedUnit for Fails {
        async fn run(self: Box<Self>, ctx: WorkerContext) -> Result<()> {
            ctx.item_error("a.mkv", "no streams").await?;
            anyhow::bail!("ffprobe exited with 1")
        }
    }

    fn tracker() -> Arc<TaskTracker> {
        TaskTracker::new(TaskId::generate(), TaskKind::MediaAnalysis, None, None)
    }

    fn start(workers: &WorkerManager, t: &Arc<TaskTracker>, unit: Box<dyn IsolatedUnit>) -> bool {
        let marker = Arc::clone(t);
        workers.run_in_worker(t.task_id().clone(), Arc::clone(t), unit, move || {
            marker.mark_running().is_ok()
        })
    }

    async fn wait_terminal(t: &Arc<TaskTracker>) -> ProgressRecord {
        let (snapshot, mut sub) = t.subscribe_with_snapshot();
        let mut last = snapshot;
        if last.is_terminal() {
            return last;
        }
        while let Some(next) = sub.recv().await {
            last = next;
        }
        last
    }

    async fn wait_inactive(workers: &WorkerManager, id: &str) {
        for _ in 0..200 {
            if !workers.is_worker_active(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker {id} never went inactive");
    }

    #[tokio::test]
    async fn ok_exit_completes_and_removes_handle() {
        let workers = WorkerManager::new();
        let t = tracker();
        assert!(start(&workers, &t, Box::new(Probe { items: 3 })));

        let p = wait_terminal(&t).await;
        assert_eq!(p.status, TaskStatus::Completed);
        assert_eq!((p.total, p.processed), (Some(3), 3));
        wait_inactive(&workers, t.task_id().as_str()).await;
    }

    #[tokio::test]
    async fn err_exit_fails() {
        let workers = WorkerManager::new();
        let t = tracker();
        start(&workers, &t, Box::new(Fails));

        let p = wait_terminal(&t).await;
        assert_eq!(p.status, TaskStatus::Failed);
        assert_eq!(p.errors.len(), 2);
        assert_eq!(p.errors[1].error, "ffprobe exited with 1");
    }

    #[tokio::test]
    async fn terminate_kills_hanging_worker() {
        let workers = WorkerManager::new();
        let t = tracker();
        let mut sub = t.subscribe();
        start(&workers, &t, Box::new(Hangs));
        let id = t.task_id().clone();

        // running, then the one progress message
        sub.recv().await.unwrap();
        sub.recv().await.unwrap();
        assert!(workers.is_worker_active(id.as_str()));

        assert!(workers.terminate_worker(id.as_str()));
        assert!(!workers.is_worker_active(id.as_str()));
        assert!(!workers.terminate_worker(id.as_str()));

        // The manager leaves the tracker to the cancellation path.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(t.status(), TaskStatus::Running);
        t.cancel();
        assert_eq!(t.progress().processed, 1);
    }

    #[tokio::test]
    async fn terminal_message_stops_the_unit() {
        let workers = WorkerManager::new();
        let t = tracker();
        start(&workers, &t, Box::new(ReportsThenHangs));

        let p = wait_terminal(&t).await;
        assert_eq!(p.status, TaskStatus::Completed);
        assert_eq!(p.processed, 1);
        wait_inactive(&workers, t.task_id().as_str()).await;
        assert_eq!(t.progress().processed, 1);
    }

    #[tokio::test]
    async fn rejected_start_spawns_nothing() {
        let workers = WorkerManager::new();
        let t = tracker();
        let started = workers.run_in_worker(
            t.task_id().clone(),
            Arc::clone(&t),
            Box::new(Probe { items: 1 }),
            || false,
        );
        assert!(!started);
        assert!(workers.active_workers().is_empty());
        assert_eq!(t.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn terminate_all_returns_ids() {
        let workers = WorkerManager::new();
        let a = tracker();
        let b = tracker();
        start(&workers, &a, Box::new(Hangs));
        start(&workers, &b, Box::new(Hangs));

        let mut killed = workers.terminate_all();
        killed.sort();
        let mut expected = vec![a.task_id().clone(), b.task_id().clone()];
        expected.sort();
        assert_eq!(killed, expected);
        assert!(workers.active_workers().is_empty());
    }
}
