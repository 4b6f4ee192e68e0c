//! The message protocol between an isolated unit and its tracker.
//!
//! Isolated units never see the tracker. They send [`WorkerMessage`]s
//! through a bounded channel and the worker manager applies them in order.
//! Subprocess workers speak the same protocol as JSON lines on stdout:
//!
//! ```text
//! {"type":"total","total":12}
//! {"type":"progress","processed":1,"succeeded":1,"currentItem":"a.mkv"}
//! {"type":"item_error","item":"b.mkv","error":"no video stream"}
//! {"type":"extension","extension":{"mediaFileId":"mf-1","stage":"probe"}}
//! {"type":"complete"}
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use curator_model::{ProgressDelta, TaskExtension, TaskId};

use crate::tracker::TaskTracker;

/// Capacity of the channel between one isolated unit and the manager.
pub const WORKER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    Progress {
        #[serde(default)]
        processed: u64,
        #[serde(default)]
        succeeded: u64,
        #[serde(default)]
        failed: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_item: Option<String>,
    },
    ItemError {
        item: String,
        error: String,
    },
    Total {
        total: u64,
    },
    Extension {
        extension: TaskExtension,
    },
    Complete,
    Fail {
        reason: String,
    },
}

impl WorkerMessage {
    pub fn progress(delta: ProgressDelta) -> Self {
        Self::Progress {
            processed: delta.processed,
            succeeded: delta.succeeded,
            failed: delta.failed,
            current_item: delta.current_item,
        }
    }

    /// Whether the message ends the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Fail { .. })
    }

    /// Apply the message to the tracker it belongs to.
    pub(crate) fn apply(self, tracker: &TaskTracker) {
        match self {
            Self::Progress {
                processed,
                succeeded,
                failed,
                current_item,
            } => {
                tracker.advance(&ProgressDelta {
                    processed,
                    succeeded,
                    failed,
                    current_item,
                });
            }
            Self::ItemError { item, error } => {
                tracker.add_error(item, error);
            }
            Self::Total { total } => {
                tracker.set_total(total);
            }
            Self::Extension { extension } => {
                tracker.set_extension(extension);
            }
            Self::Complete => {
                tracker.complete();
            }
            Self::Fail { reason } => {
                tracker.fail(reason);
            }
        }
    }
}

/// The only handle an isolated unit gets: a message sender.
#[derive(Debug)]
pub struct WorkerContext {
    task_id: TaskId,
    tx: mpsc::Sender<WorkerMessage>,
}

impl WorkerContext {
    pub fn new(task_id: TaskId, tx: mpsc::Sender<WorkerMessage>) -> Self {
        Self { task_id, tx }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Send one message. Waits when the channel is full; fails once the
    /// manager has stopped listening.
    pub async fn send(&self, message: WorkerMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .ok()
            .with_context(|| format!("task {} is no longer accepting messages", self.task_id))
    }

    pub async fn advance(&self, delta: ProgressDelta) -> Result<()> {
        self.send(WorkerMessage::progress(delta)).await
    }

    pub async fn item_error(
        &self,
        item: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<()> {
        self.send(WorkerMessage::ItemError {
            item: item.into(),
            error: error.into(),
        })
        .await
    }

    pub async fn set_total(&self, total: u64) -> Result<()> {
        self.send(WorkerMessage::Total { total }).await
    }

    pub async fn set_extension(&self, extension: TaskExtension) -> Result<()> {
        self.send(WorkerMessage::Extension { extension }).await
    }

    pub async fn complete(&self) -> Result<()> {
        self.send(WorkerMessage::Complete).await
    }

    pub async fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.send(WorkerMessage::Fail {
            reason: reason.into(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_model::{AnalysisExtension, TaskKind, TaskStatus};

    #[test]
    fn parses_jsonl_protocol() {
        let lines = [
            r#"{"type":"total","total":2}"#,
            r#"{"type":"progress","succeeded":1,"currentItem":"a.mkv"}"#,
            r#"{"type":"item_error","item":"b.mkv","error":"no video stream"}"#,
            r#"{"type":"extension","extension":{"mediaFileId":"mf-1","stage":"probe"}}"#,
            r#"{"type":"fail","reason":"ffprobe crashed"}"#,
        ];
        let parsed: Vec<WorkerMessage> = lines
            .iter()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(parsed[0], WorkerMessage::Total { total: 2 });
        assert_eq!(
            parsed[1],
            WorkerMessage::progress(
                ProgressDelta::new()
                    .with_succeeded(1)
                    .with_current_item("a.mkv")
            )
        );
        assert!(matches!(parsed[2], WorkerMessage::ItemError { .. }));
        assert_eq!(
            parsed[3],
            WorkerMessage::Extension {
                extension: TaskExtension::Analysis(AnalysisExtension {
                    media_file_id: "mf-1".to_owned(),
                    stage: Some("probe".to_owned()),
                })
            }
        );
        assert!(parsed[4].is_terminal());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<WorkerMessage>(r#"{"type":"explode"}"#).is_err());
    }

    #[test]
    fn apply_drives_tracker() {
        let tracker = TaskTracker::new(TaskId::generate(), TaskKind::MediaAnalysis, None, None);
        tracker.mark_running().unwrap();

        WorkerMessage::Total { total: 1 }.apply(&tracker);
        WorkerMessage::progress(ProgressDelta::item_succeeded()).apply(&tracker);
        WorkerMessage::Complete.apply(&tracker);

        let p = tracker.progress();
        assert_eq!(p.status, TaskStatus::Completed);
        assert_eq!((p.total, p.processed, p.succeeded), (Some(1), 1, 1));
    }

    #[tokio::test]
    async fn send_fails_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        let ctx = WorkerContext::new(TaskId::from("t"), tx);
        drop(rx);
        assert!(ctx.complete().await.is_err());
    }
}
