//! Live progress streams.
//!
//! A [`ProgressGateway`] turns a tracker subscription into a stream that
//! yields one snapshot per mutation and ends after the terminal snapshot.
//! Dropping the stream unsubscribes.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tracing::debug;

use curator_model::ProgressRecord;

use crate::error::{TaskError, TaskResult};
use crate::registry::TaskRegistry;

pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressRecord> + Send>>;

#[derive(Debug, Clone)]
pub struct ProgressGateway {
    registry: Arc<TaskRegistry>,
}

impl ProgressGateway {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    /// Open a stream for `task_id`.
    ///
    /// Unknown ids fail immediately. A task that is already finished yields
    /// its final snapshot once; otherwise the stream yields every later
    /// mutation and closes after the first terminal snapshot.
    ///
    /// The current state of an unfinished task is not replayed. A task that
    /// is queued, or running without reporting, yields nothing until its
    /// next change. Fetch the record (`GET /api/tasks/{id}`) before opening
    /// the stream to render something in the meantime.
    pub fn open(&self, task_id: &str) -> TaskResult<ProgressStream> {
        let tracker = self
            .registry
            .get(task_id)
            .ok_or_else(|| TaskError::not_found(task_id))?;
        let (snapshot, mut subscription) = tracker.subscribe_with_snapshot();

        if snapshot.is_terminal() {
            return Ok(Box::pin(futures::stream::once(async move { snapshot })));
        }

        let task_id = tracker.task_id().clone();
        drop(tracker);
        Ok(Box::pin(async_stream::stream! {
            while let Some(record) = subscription.recv().await {
                let done = record.is_terminal();
                yield record;
                if done {
                    break;
                }
            }
            subscription.unsubscribe();
            debug!(task_id = %task_id, "progress stream closed");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    use curator_model::{ProgressDelta, TaskId, TaskKind, TaskStatus};

    use crate::tracker::TaskTracker;

    fn setup() -> (Arc<TaskRegistry>, ProgressGateway, Arc<TaskTracker>) {
        let registry = Arc::new(TaskRegistry::new());
        let tracker = TaskTracker::new(TaskId::generate(), TaskKind::LibraryScan, Some(2), None);
        registry.insert(Arc::clone(&tracker));
        let gateway = ProgressGateway::new(Arc::clone(&registry));
        (registry, gateway, tracker)
    }

    #[test]
    fn unknown_task_is_not_found() {
        let (_registry, gateway, _tracker) = setup();
        assert!(matches!(gateway.open("nope"), Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn finished_task_yields_one_snapshot() {
        let (_registry, gateway, tracker) = setup();
        tracker.mark_running().unwrap();
        tracker.complete();

        let records: Vec<ProgressRecord> = gateway
            .open(tracker.task_id().as_str())
            .unwrap()
            .collect()
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn live_stream_ends_after_terminal() {
        let (_registry, gateway, tracker) = setup();
        let stream = gateway.open(tracker.task_id().as_str()).unwrap();

        tracker.mark_running().unwrap();
        tracker.advance(&ProgressDelta::item_succeeded());
        tracker.advance(&ProgressDelta::item_failed());
        tracker.fail("gave up");

        let statuses: Vec<(TaskStatus, u64)> = stream
            .map(|r| (r.status, r.processed))
            .collect()
            .await;
        assert_eq!(
            statuses,
            vec![
                (TaskStatus::Running, 0),
                (TaskStatus::Running, 1),
                (TaskStatus::Running, 2),
                (TaskStatus::Failed, 2),
            ]
        );
    }

    #[tokio::test]
    async fn dropping_stream_unsubscribes() {
        let (_registry, gateway, tracker) = setup();
        let stream = gateway.open(tracker.task_id().as_str()).unwrap();
        assert_eq!(tracker.subscriber_count(), 1);
        drop(stream);
        assert_eq!(tracker.subscriber_count(), 0);
    }
}
