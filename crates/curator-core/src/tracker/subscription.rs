//! Per-subscriber progress channels.

use std::sync::Weak;

use curator_model::ProgressRecord;
use tokio::sync::mpsc;

use super::TaskTracker;

/// A live view of one tracker's mutations.
///
/// Every mutation after the subscription was taken arrives as one snapshot,
/// in mutation order. The channel closes after the terminal snapshot, so
/// [`recv`](Self::recv) returning `None` means the task is finished or the
/// subscription was removed.
///
/// Dropping the subscription unsubscribes it.
pub struct ProgressSubscription {
    id: u64,
    tracker: Weak<TaskTracker>,
    rx: mpsc::UnboundedReceiver<ProgressRecord>,
    attached: bool,
}

impl ProgressSubscription {
    pub(super) fn new(
        id: u64,
        tracker: Weak<TaskTracker>,
        rx: mpsc::UnboundedReceiver<ProgressRecord>,
    ) -> Self {
        Self {
            id,
            tracker,
            rx,
            attached: true,
        }
    }

    /// Wait for the next snapshot.
    pub async fn recv(&mut self) -> Option<ProgressRecord> {
        self.rx.recv().await
    }

    /// Take the next snapshot if one is already buffered.
    pub fn try_recv(&mut self) -> Option<ProgressRecord> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Snapshots already buffered can still be drained.
    /// Calling this more than once is harmless.
    pub fn unsubscribe(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.remove_subscriber(self.id);
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for ProgressSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSubscription")
            .field("id", &self.id)
            .field("attached", &self.attached)
            .finish()
    }
}
