//! Per-task progress tracking.
//!
//! A [`TaskTracker`] owns one task's [`ProgressRecord`], enforces the status
//! graph, and fans out a snapshot to every subscriber on each mutation:
//!
//! ```text
//! pending -> running -> completed | failed | cancelled
//! pending -> cancelled   (withdrawal only)
//! ```
//!
//! Terminal statuses are absorbing: later updates are logged and dropped.

mod subscription;

pub use subscription::ProgressSubscription;

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use curator_model::{
    ErrorEntry, ProgressDelta, ProgressRecord, TaskExtension, TaskId, TaskKind, TaskStatus,
};

use crate::error::{TaskError, TaskResult};

/// Item label used for the task-fatal error entry appended by [`TaskTracker::fail`].
pub const TASK_ERROR_ITEM: &str = "task";

/// Callback run once, with the final snapshot, when the task first becomes
/// terminal. Runs after the tracker lock has been released.
pub type TerminalHook = Box<dyn FnOnce(&ProgressRecord) + Send>;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<ProgressRecord>,
}

struct TrackerState {
    record: ProgressRecord,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

impl TrackerState {
    /// Push the current record to every live subscriber, pruning the ones
    /// whose receiver is gone. Once terminal, all channels are closed.
    fn notify(&mut self) {
        let snapshot = &self.record;
        self.subscribers
            .retain(|sub| sub.tx.send(snapshot.clone()).is_ok());
        if snapshot.is_terminal() {
            self.subscribers.clear();
        }
    }
}

/// Owner of one task's mutable progress state.
pub struct TaskTracker {
    task_id: TaskId,
    kind: TaskKind,
    state: Mutex<TrackerState>,
    on_terminal: Mutex<Option<TerminalHook>>,
}

impl TaskTracker {
    /// Create a tracker in `pending`.
    pub fn new(
        task_id: TaskId,
        kind: TaskKind,
        total: Option<u64>,
        title: Option<String>,
    ) -> Arc<Self> {
        Self::build(task_id, kind, total, title, None)
    }

    /// Create a tracker in `pending` with a hook to run on the first
    /// terminal transition.
    pub fn with_terminal_hook(
        task_id: TaskId,
        kind: TaskKind,
        total: Option<u64>,
        title: Option<String>,
        hook: TerminalHook,
    ) -> Arc<Self> {
        Self::build(task_id, kind, total, title, Some(hook))
    }

    fn build(
        task_id: TaskId,
        kind: TaskKind,
        total: Option<u64>,
        title: Option<String>,
        hook: Option<TerminalHook>,
    ) -> Arc<Self> {
        let record = ProgressRecord::new(task_id.clone(), kind, total, title);
        Arc::new(Self {
            task_id,
            kind,
            state: Mutex::new(TrackerState {
                record,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
            on_terminal: Mutex::new(hook),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().record.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Copy of the current record.
    pub fn progress(&self) -> ProgressRecord {
        self.state.lock().record.clone()
    }

    /// Current record in its JSON wire shape.
    pub fn serialized(&self) -> serde_json::Result<serde_json::Value> {
        self.progress().to_json()
    }

    // -----------------------------------------------------------------------
    // Status transitions
    // -----------------------------------------------------------------------

    /// `pending -> running`.
    pub fn mark_running(&self) -> TaskResult<()> {
        let mut state = self.state.lock();
        let from = state.record.status;
        if !from.can_transition_to(TaskStatus::Running) {
            return Err(TaskError::InvalidTransition {
                task_id: self.task_id.clone(),
                from,
                to: TaskStatus::Running,
            });
        }
        state.record.status = TaskStatus::Running;
        state.notify();
        debug!(task_id = %self.task_id, kind = %self.kind, "task running");
        Ok(())
    }

    /// Transition to `completed`. Returns whether the transition happened.
    pub fn complete(&self) -> bool {
        self.finish(TaskStatus::Completed, None)
    }

    /// Transition to `failed`, recording `reason` as the final error entry.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.finish(TaskStatus::Failed, Some(reason.into()))
    }

    /// Transition to `cancelled`.
    pub fn cancel(&self) -> bool {
        self.finish(TaskStatus::Cancelled, None)
    }

    fn finish(&self, to: TaskStatus, reason: Option<String>) -> bool {
        let snapshot = {
            let mut state = self.state.lock();
            let from = state.record.status;
            if !from.can_transition_to(to) {
                debug!(
                    task_id = %self.task_id,
                    from = %from,
                    to = %to,
                    "ignoring terminal transition"
                );
                return false;
            }
            let record = &mut state.record;
            record.status = to;
            record.completed_at = Some(Utc::now());
            if let Some(reason) = reason {
                record.errors.push(ErrorEntry::new(TASK_ERROR_ITEM, reason));
            }
            state.notify();
            state.record.clone()
        };

        let hook = self.on_terminal.lock().take();
        if let Some(hook) = hook {
            hook(&snapshot);
        }

        tracing::info!(
            task_id = %self.task_id,
            kind = %self.kind,
            status = %to,
            processed = snapshot.processed,
            failed = snapshot.failed,
            "task finished"
        );
        true
    }

    // -----------------------------------------------------------------------
    // Progress mutations
    // -----------------------------------------------------------------------

    /// Merge counter increments. Ignored once terminal.
    pub fn advance(&self, delta: &ProgressDelta) -> bool {
        let task_id = &self.task_id;
        self.mutate("advance", |record| {
            if record.apply_delta(delta) {
                debug!(
                    task_id = %task_id,
                    processed = record.processed,
                    succeeded = record.succeeded,
                    failed = record.failed,
                    "clamped progress counters"
                );
            }
        })
    }

    /// Set (or revise) the number of items the task will process.
    pub fn set_total(&self, total: u64) -> bool {
        let task_id = &self.task_id;
        self.mutate("set_total", |record| {
            if record.set_total(total) {
                debug!(task_id = %task_id, total, "clamped progress counters to new total");
            }
        })
    }

    pub fn set_current_item(&self, item: impl Into<String>) -> bool {
        let item = item.into();
        self.mutate("set_current_item", |record| record.current_item = Some(item))
    }

    pub fn set_extension(&self, extension: TaskExtension) -> bool {
        self.mutate("set_extension", |record| record.extension = Some(extension))
    }

    /// Append an item-level error. Counters are left alone.
    pub fn add_error(&self, item: impl Into<String>, error: impl Into<String>) -> bool {
        let entry = ErrorEntry::new(item, error);
        self.mutate("add_error", |record| record.errors.push(entry))
    }

    fn mutate(&self, op: &'static str, f: impl FnOnce(&mut ProgressRecord)) -> bool {
        let mut state = self.state.lock();
        if state.record.is_terminal() {
            warn!(
                task_id = %self.task_id,
                op,
                status = %state.record.status,
                "ignoring update to finished task"
            );
            return false;
        }
        f(&mut state.record);
        state.notify();
        true
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Receive one snapshot per future mutation.
    pub fn subscribe(self: &Arc<Self>) -> ProgressSubscription {
        self.subscribe_with_snapshot().1
    }

    /// The current snapshot plus a subscription that observes every later
    /// mutation, taken atomically. On a terminal tracker the subscription is
    /// already closed.
    pub fn subscribe_with_snapshot(self: &Arc<Self>) -> (ProgressRecord, ProgressSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        if !state.record.is_terminal() {
            state.subscribers.push(Subscriber { id, tx });
        }
        let snapshot = state.record.clone();
        drop(state);
        (snapshot, ProgressSubscription::new(id, Arc::downgrade(self), rx))
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn remove_subscriber(&self, id: u64) {
        self.state.lock().subscribers.retain(|sub| sub.id != id);
    }
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("task_id", &self.task_id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use curator_model::{ScanExtension, ScanPhase};

    fn tracker(total: Option<u64>) -> Arc<TaskTracker> {
        TaskTracker::new(TaskId::generate(), TaskKind::LibraryScan, total, None)
    }

    #[test]
    fn starts_pending() {
        let t = tracker(None);
        let p = t.progress();
        assert_eq!(p.status, TaskStatus::Pending);
        assert!(p.completed_at.is_none());
        assert_eq!(p.total, None);
    }

    #[test]
    fn mark_running_twice_is_rejected() {
        let t = tracker(None);
        t.mark_running().unwrap();
        let err = t.mark_running().unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                from: TaskStatus::Running,
                to: TaskStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn complete_sets_completed_at_once() {
        let t = tracker(Some(1));
        t.mark_running().unwrap();
        assert!(t.complete());
        let first = t.progress().completed_at;
        assert!(first.is_some());

        assert!(!t.complete());
        assert!(!t.fail("late"));
        assert!(!t.cancel());
        let p = t.progress();
        assert_eq!(p.status, TaskStatus::Completed);
        assert_eq!(p.completed_at, first);
        assert!(p.errors.is_empty());
    }

    #[test]
    fn completing_a_pending_task_is_rejected() {
        let t = tracker(None);
        assert!(!t.complete());
        assert!(!t.fail("nope"));
        assert_eq!(t.status(), TaskStatus::Pending);
    }

    #[test]
    fn pending_can_be_cancelled() {
        let t = tracker(None);
        assert!(t.cancel());
        assert_eq!(t.status(), TaskStatus::Cancelled);
        assert!(t.mark_running().is_err());
    }

    #[test]
    fn fail_appends_reason() {
        let t = tracker(None);
        t.mark_running().unwrap();
        t.add_error("a.mkv", "corrupt");
        assert!(t.fail("disk unplugged"));
        let p = t.progress();
        assert_eq!(p.status, TaskStatus::Failed);
        assert_eq!(
            p.errors,
            vec![
                ErrorEntry::new("a.mkv", "corrupt"),
                ErrorEntry::new("task", "disk unplugged"),
            ]
        );
    }

    #[test]
    fn updates_after_terminal_are_ignored() {
        let t = tracker(Some(5));
        t.mark_running().unwrap();
        t.advance(&ProgressDelta::item_succeeded());
        t.cancel();

        assert!(!t.advance(&ProgressDelta::item_succeeded()));
        assert!(!t.add_error("x", "y"));
        assert!(!t.set_total(9));
        assert!(!t.set_current_item("z"));

        let p = t.progress();
        assert_eq!(p.processed, 1);
        assert_eq!(p.total, Some(5));
        assert!(p.errors.is_empty());
    }

    #[test]
    fn add_error_leaves_counters_alone() {
        let t = tracker(None);
        t.mark_running().unwrap();
        t.add_error("a", "b");
        let p = t.progress();
        assert_eq!((p.processed, p.failed), (0, 0));
        assert_eq!(p.errors.len(), 1);
    }

    #[test]
    fn progress_is_a_copy() {
        let t = tracker(None);
        let mut copy = t.progress();
        copy.processed = 99;
        copy.status = TaskStatus::Completed;
        assert_eq!(t.progress().processed, 0);
        assert_eq!(t.status(), TaskStatus::Pending);
    }

    #[test]
    fn serialized_uses_wire_names() {
        let t = tracker(None);
        t.mark_running().unwrap();
        t.set_extension(TaskExtension::Scan(ScanExtension {
            phase: ScanPhase::Discovering,
            folders_scanned: 1,
            files_discovered: 0,
        }));
        let v = t.serialized().unwrap();
        assert_eq!(v["status"], "running");
        assert_eq!(v["type"], "library_scan");
        assert_eq!(v["phase"], "discovering");
    }

    #[test]
    fn terminal_hook_runs_once_without_lock() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let slot: Arc<Mutex<Option<Arc<TaskTracker>>>> = Arc::new(Mutex::new(None));
        let slot_in_hook = Arc::clone(&slot);

        let t = TaskTracker::with_terminal_hook(
            TaskId::generate(),
            TaskKind::MediaAnalysis,
            None,
            None,
            Box::new(move |record| {
                assert_eq!(record.status, TaskStatus::Failed);
                seen.fetch_add(1, Ordering::SeqCst);
                // Reading the tracker from inside the hook must not deadlock.
                if let Some(t) = slot_in_hook.lock().as_ref() {
                    assert_eq!(t.status(), TaskStatus::Failed);
                }
            }),
        );
        *slot.lock() = Some(Arc::clone(&t));

        t.mark_running().unwrap();
        t.fail("boom");
        t.fail("again");
        t.complete();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_see_every_mutation_in_order() {
        let t = tracker(Some(3));
        let mut sub = t.subscribe();

        t.mark_running().unwrap();
        for _ in 0..3 {
            t.advance(&ProgressDelta::item_succeeded());
        }
        t.complete();

        let mut seen = Vec::new();
        while let Some(snapshot) = sub.recv().await {
            seen.push((snapshot.status, snapshot.processed));
        }
        assert_eq!(
            seen,
            vec![
                (TaskStatus::Running, 0),
                (TaskStatus::Running, 1),
                (TaskStatus::Running, 2),
                (TaskStatus::Running, 3),
                (TaskStatus::Completed, 3),
            ]
        );
        assert_eq!(t.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let t = tracker(None);
        let mut sub = t.subscribe();
        assert_eq!(t.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_attached());
        assert_eq!(t.subscriber_count(), 0);

        t.mark_running().unwrap();
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn dropping_subscription_detaches() {
        let t = tracker(None);
        let sub = t.subscribe();
        let _other = t.subscribe();
        drop(sub);
        assert_eq!(t.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn subscribing_to_finished_task_yields_nothing_more() {
        let t = tracker(None);
        t.mark_running().unwrap();
        t.complete();

        let (snapshot, mut sub) = t.subscribe_with_snapshot();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert!(sub.recv().await.is_none());
    }
}
