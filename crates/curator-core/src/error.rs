use curator_model::{TaskId, TaskKind, TaskStatus};

/// Errors surfaced by the task core's boundary operations.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// No tracker exists for the id (never created, or already evicted).
    #[error("task {0} not found")]
    NotFound(String),

    /// The operation is not allowed in the task's current status.
    #[error("task {task_id} cannot be changed while {status}")]
    InvalidState { task_id: TaskId, status: TaskStatus },

    /// A status change that is not an edge of the status graph.
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("no unit of work registered for task kind {0}")]
    UnitUnavailable(TaskKind),

    #[error("invalid task request: {0}")]
    InvalidRequest(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl TaskError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }
}

pub type TaskResult<T> = Result<T, TaskError>;
