//! Per-task cancellation flags.
//!
//! Cooperative units poll their flag between steps. Worker-isolated units
//! are also terminated outright; see [`crate::worker::WorkerManager`].

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use curator_model::{CancelStrategy, TaskId};

/// Result of an accepted cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub task_id: TaskId,
    pub strategy: CancelStrategy,
}

#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag for `task_id`, created on first use.
    pub fn register(&self, task_id: &TaskId) -> CancellationToken {
        self.tokens
            .lock()
            .entry(task_id.clone())
            .or_default()
            .clone()
    }

    /// Raise the flag. Returns `false` when no flag exists for the id.
    pub fn request_cancellation(&self, task_id: &str) -> bool {
        match self.tokens.lock().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.tokens
            .lock()
            .get(task_id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn token(&self, task_id: &str) -> Option<CancellationToken> {
        self.tokens.lock().get(task_id).cloned()
    }

    /// Drop the flag once the task is finished.
    pub fn remove(&self, task_id: &str) -> Option<CancellationToken> {
        self.tokens.lock().remove(task_id)
    }

    /// Raise every flag. Returns how many were raised.
    pub fn cancel_all(&self) -> usize {
        let tokens = self.tokens.lock();
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_raises_shared_flag() {
        let registry = CancellationRegistry::new();
        let id = TaskId::from("t1");
        let token = registry.register(&id);

        assert!(!registry.is_cancelled("t1"));
        assert!(registry.request_cancellation("t1"));
        assert!(registry.is_cancelled("t1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn register_is_idempotent() {
        let registry = CancellationRegistry::new();
        let id = TaskId::from("t1");
        let a = registry.register(&id);
        let b = registry.register(&id);
        a.cancel();
        assert!(b.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_ids() {
        let registry = CancellationRegistry::new();
        assert!(!registry.request_cancellation("ghost"));
        assert!(!registry.is_cancelled("ghost"));
        assert!(registry.remove("ghost").is_none());
    }

    #[test]
    fn outcome_wire_shape() {
        let outcome = CancelOutcome {
            task_id: TaskId::from("t1"),
            strategy: CancelStrategy::Forced,
        };
        let v = serde_json::to_value(&outcome).unwrap();
        assert_eq!(v, serde_json::json!({"taskId": "t1", "strategy": "forced"}));
    }
}
