//! Units of work: what a task actually does.
//!
//! A task kind supplies either a [`CooperativeUnit`], which runs in-process
//! with direct access to its tracker and polls a cancellation flag, or an
//! [`IsolatedUnit`], which runs in a worker and can only send messages.

pub mod registry;
pub mod scan;

pub use registry::{FnFactory, UnitFactory, UnitRegistry};
pub use scan::{LibraryScan, LibraryScanFactory};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use curator_model::{ProgressDelta, TaskExtension, TaskId};

use crate::tracker::TaskTracker;
use crate::worker::WorkerContext;

/// A unit that runs in-process and stops itself when asked.
///
/// Returning `Ok` completes the task, or cancels it if cancellation was
/// requested. Returning `Err` fails it with the error as the reason.
#[async_trait]
pub trait CooperativeUnit: Send {
    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<()>;
}

/// A unit that runs in an isolated worker and may be terminated at any
/// await point.
#[async_trait]
pub trait IsolatedUnit: Send {
    async fn run(self: Box<Self>, ctx: WorkerContext) -> Result<()>;
}

/// A built unit, ready to be admitted.
pub enum TaskWork {
    Cooperative(Box<dyn CooperativeUnit>),
    Isolated(Box<dyn IsolatedUnit>),
}

impl TaskWork {
    pub fn cooperative(unit: impl CooperativeUnit + 'static) -> Self {
        Self::Cooperative(Box::new(unit))
    }

    pub fn isolated(unit: impl IsolatedUnit + 'static) -> Self {
        Self::Isolated(Box::new(unit))
    }
}

impl std::fmt::Debug for TaskWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cooperative(_) => f.write_str("TaskWork::Cooperative"),
            Self::Isolated(_) => f.write_str("TaskWork::Isolated"),
        }
    }
}

/// What a cooperative unit sees: its tracker and its cancellation flag.
#[derive(Clone)]
pub struct TaskContext {
    tracker: Arc<TaskTracker>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(tracker: Arc<TaskTracker>, cancel: CancellationToken) -> Self {
        Self { tracker, cancel }
    }

    pub fn task_id(&self) -> &TaskId {
        self.tracker.task_id()
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Yield to the scheduler, then report whether the unit should stop.
    pub async fn checkpoint(&self) -> bool {
        tokio::task::yield_now().await;
        self.cancel.is_cancelled()
    }

    pub fn advance(&self, delta: ProgressDelta) {
        self.tracker.advance(&delta);
    }

    pub fn set_total(&self, total: u64) {
        self.tracker.set_total(total);
    }

    pub fn set_current_item(&self, item: impl Into<String>) {
        self.tracker.set_current_item(item);
    }

    pub fn set_extension(&self, extension: TaskExtension) {
        self.tracker.set_extension(extension);
    }

    /// Record an item-level failure and count it.
    pub fn item_failed(&self, item: impl Into<String>, error: impl Into<String>) {
        self.tracker.add_error(item, error);
        self.tracker.advance(&ProgressDelta::item_failed());
    }

    /// Acknowledge cancellation and stop the task now.
    pub fn cancel(&self) -> bool {
        self.tracker.cancel()
    }
}

/// Spawn a cooperative unit and finalize its tracker when it returns.
pub(crate) fn spawn_cooperative(
    tracker: Arc<TaskTracker>,
    unit: Box<dyn CooperativeUnit>,
    cancel: CancellationToken,
) {
    let ctx = TaskContext::new(Arc::clone(&tracker), cancel.clone());
    tokio::spawn(async move {
        let outcome = tokio::spawn(unit.run(ctx)).await;
        match outcome {
            Ok(Ok(())) => {
                if cancel.is_cancelled() {
                    tracker.cancel();
                } else {
                    tracker.complete();
                }
            }
            Ok(Err(e)) => {
                warn!(task_id = %tracker.task_id(), error = %e, "task failed");
                tracker.fail(format!("{e:#}"));
            }
            Err(join_err) => {
                error!(task_id = %tracker.task_id(), error = %join_err, "task panicked");
                tracker.fail(format!("task panicked: {join_err}"));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_model::{TaskKind, TaskStatus};

    struct Counting {
        steps: u64,
    }

    #[async_trait]
    impl CooperativeUnit for Counting {
        async fn run(self: Box<Self>, ctx: TaskContext) -> Result<()> {
            ctx.set_total(self.steps);
            for _ in 0..self.steps {
                if ctx.checkpoint().await {
                    return Ok(());
                }
                ctx.advance(ProgressDelta::item_succeeded());
            }
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl CooperativeUnit for Broken {
        async fn run(self: Box<Self>, _ctx: TaskContext) -> Result<()> {
            anyhow::bail!("library root vanished")
        }
    }

    struct Panics;

    #[async_trait]
    impl CooperativeUnit for Panics {
        async fn run(self: Box<Self>, _ctx: TaskContext) -> Result<()> {
            panic!("unit bug")
        }
    }

    fn running_tracker() -> Arc<TaskTracker> {
        let t = TaskTracker::new(TaskId::generate(), TaskKind::LibraryScan, None, None);
        t.mark_running().unwrap();
        t
    }

    async fn finished(tracker: &Arc<TaskTracker>) -> curator_model::ProgressRecord {
        let (snapshot, mut sub) = tracker.subscribe_with_snapshot();
        if snapshot.is_terminal() {
            return snapshot;
        }
        let mut last = snapshot;
        while let Some(next) = sub.recv().await {
            last = next;
        }
        last
    }

    #[tokio::test]
    async fn ok_completes() {
        let t = running_tracker();
        spawn_cooperative(
            Arc::clone(&t),
            Box::new(Counting { steps: 3 }),
            CancellationToken::new(),
        );
        let p = finished(&t).await;
        assert_eq!(p.status, TaskStatus::Completed);
        assert_eq!(p.succeeded, 3);
    }

    #[tokio::test]
    async fn ok_after_cancellation_cancels() {
        let t = running_tracker();
        let cancel = CancellationToken::new();
        cancel.cancel();
        spawn_cooperative(Arc::clone(&t), Box::new(Counting { steps: 3 }), cancel);
        let p = finished(&t).await;
        assert_eq!(p.status, TaskStatus::Cancelled);
        assert_eq!(p.processed, 0);
    }

    #[tokio::test]
    async fn err_fails_with_reason() {
        let t = running_tracker();
        spawn_cooperative(Arc::clone(&t), Box::new(Broken), CancellationToken::new());
        let p = finished(&t).await;
        assert_eq!(p.status, TaskStatus::Failed);
        assert_eq!(p.errors.last().unwrap().error, "library root vanished");
    }

    #[tokio::test]
    async fn panic_fails() {
        let t = running_tracker();
        spawn_cooperative(Arc::clone(&t), Box::new(Panics), CancellationToken::new());
        let p = finished(&t).await;
        assert_eq!(p.status, TaskStatus::Failed);
        assert!(p.errors.last().unwrap().error.contains("panicked"));
    }

    #[test]
    fn item_failed_counts_and_records() {
        let t = running_tracker();
        let ctx = TaskContext::new(Arc::clone(&t), CancellationToken::new());
        ctx.item_failed("a.mkv", "unreadable");
        let p = t.progress();
        assert_eq!((p.processed, p.failed), (1, 1));
        assert_eq!(p.errors.len(), 1);
    }
}
