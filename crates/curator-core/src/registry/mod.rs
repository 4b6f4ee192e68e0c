//! Process-wide task registry.
//!
//! Maps task ids to their trackers. Terminal trackers stay visible for a
//! grace period so late polls still see the final state, then are evicted.
//! An evicted id is indistinguishable from one that never existed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use curator_model::{ProgressRecord, TaskCounts, TaskId};

use crate::tracker::TaskTracker;

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, Arc<TaskTracker>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tracker under its own id, replacing any previous entry.
    pub fn insert(&self, tracker: Arc<TaskTracker>) {
        let id = tracker.task_id().clone();
        self.tasks.lock().insert(id, tracker);
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskTracker>> {
        self.tasks.lock().get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<TaskTracker>> {
        self.tasks.lock().remove(task_id)
    }

    /// Evict `task_id` after `grace`.
    ///
    /// Only the tracker registered at scheduling time is removed; if the id
    /// has been re-registered since, the newer tracker is left in place.
    /// Returns `None` when called outside a tokio runtime, in which case the
    /// tracker is removed immediately.
    pub fn schedule_cleanup(
        self: &Arc<Self>,
        task_id: TaskId,
        grace: Duration,
    ) -> Option<JoinHandle<()>> {
        let Some(expected) = self.get(task_id.as_str()) else {
            return None;
        };
        let expected = Arc::downgrade(&expected);

        let registry = Arc::downgrade(self);
        let evict = move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut tasks = registry.tasks.lock();
            let same = match (tasks.get(task_id.as_str()), expected.upgrade()) {
                (Some(current), Some(expected)) => Arc::ptr_eq(current, &expected),
                _ => false,
            };
            if same {
                tasks.remove(task_id.as_str());
                debug!(task_id = %task_id, "evicted finished task");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(async move {
                tokio::time::sleep(grace).await;
                evict();
            })),
            Err(_) => {
                warn!("no async runtime for delayed eviction; evicting now");
                evict();
                None
            }
        }
    }

    /// Snapshots of every pending or running task, oldest first.
    pub fn active_tasks(&self) -> Vec<ProgressRecord> {
        let mut out: Vec<ProgressRecord> = {
            let tasks = self.tasks.lock();
            tasks
                .values()
                .map(|t| t.progress())
                .filter(|p| !p.is_terminal())
                .collect()
        };
        out.sort_by_key(|p| p.started_at);
        out
    }

    /// Snapshots of every registered task, terminal ones included.
    pub fn all_tasks(&self) -> Vec<ProgressRecord> {
        let mut out: Vec<ProgressRecord> = {
            let tasks = self.tasks.lock();
            tasks.values().map(|t| t.progress()).collect()
        };
        out.sort_by_key(|p| p.started_at);
        out
    }

    pub fn task_counts(&self) -> TaskCounts {
        let tasks = self.tasks.lock();
        tasks.values().map(|t| t.status()).collect()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_model::{TaskKind, TaskStatus};

    fn tracker() -> Arc<TaskTracker> {
        TaskTracker::new(TaskId::generate(), TaskKind::LibraryScan, None, None)
    }

    #[test]
    fn insert_get_remove() {
        let registry = TaskRegistry::new();
        let t = tracker();
        let id = t.task_id().clone();
        registry.insert(Arc::clone(&t));

        assert!(Arc::ptr_eq(&registry.get(id.as_str()).unwrap(), &t));
        assert!(registry.get("not-a-task").is_none());
        assert!(registry.remove(id.as_str()).is_some());
        assert!(registry.get(id.as_str()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn active_excludes_terminal() {
        let registry = TaskRegistry::new();
        let running = tracker();
        running.mark_running().unwrap();
        let pending = tracker();
        let done = tracker();
        done.mark_running().unwrap();
        done.complete();

        for t in [&running, &pending, &done] {
            registry.insert(Arc::clone(t));
        }

        let active = registry.active_tasks();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|p| !p.is_terminal()));
        assert_eq!(registry.all_tasks().len(), 3);

        let counts = registry.task_counts();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.total, 3);
    }

    #[tokio::test]
    async fn cleanup_evicts_after_grace() {
        let registry = Arc::new(TaskRegistry::new());
        let t = tracker();
        let id = t.task_id().clone();
        registry.insert(t);

        let handle = registry
            .schedule_cleanup(id.clone(), Duration::from_millis(20))
            .unwrap();
        assert!(registry.get(id.as_str()).is_some());
        handle.await.unwrap();
        assert!(registry.get(id.as_str()).is_none());
    }

    #[tokio::test]
    async fn cleanup_leaves_replacement_alone() {
        let registry = Arc::new(TaskRegistry::new());
        let first = tracker();
        let id = first.task_id().clone();
        registry.insert(first);

        let handle = registry
            .schedule_cleanup(id.clone(), Duration::from_millis(20))
            .unwrap();

        let replacement = TaskTracker::new(id.clone(), TaskKind::MetadataRefresh, None, None);
        registry.insert(Arc::clone(&replacement));
        handle.await.unwrap();

        let current = registry.get(id.as_str()).unwrap();
        assert!(Arc::ptr_eq(&current, &replacement));
        assert_eq!(current.status(), TaskStatus::Pending);
    }

    #[test]
    fn cleanup_of_unknown_id_is_noop() {
        let registry = Arc::new(TaskRegistry::new());
        assert!(registry
            .schedule_cleanup(TaskId::from("missing"), Duration::from_secs(1))
            .is_none());
    }
}
