//! `curator run` command: run one task in the foreground and stream its
//! progress to stdout as JSON lines.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::{Map, Value};

use curator_core::{CreateStatus, TaskError, TaskManager, TaskRequest};
use curator_model::{ProgressRecord, TaskKind, TaskStatus};

/// Options for a single foreground run.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub title: Option<String>,
    pub paths: Vec<PathBuf>,
    pub media_file_id: Option<String>,
}

/// Build the create request for `kind` from command-line options.
pub fn build_request(kind: TaskKind, options: RunOptions) -> TaskRequest {
    let mut params = Map::new();
    if !options.paths.is_empty() {
        let paths = options
            .paths
            .iter()
            .map(|p| Value::String(p.display().to_string()))
            .collect();
        params.insert("paths".to_owned(), Value::Array(paths));
    }
    if let Some(id) = options.media_file_id {
        params.insert("mediaFileId".to_owned(), Value::String(id));
    }

    let request = TaskRequest::new(kind).with_params(Value::Object(params));
    match options.title {
        Some(title) => request.with_title(title),
        None => request,
    }
}

/// Process exit code for a terminal status.
pub fn exit_code(status: TaskStatus) -> i32 {
    match status {
        TaskStatus::Completed => 0,
        TaskStatus::Cancelled => 130,
        TaskStatus::Failed | TaskStatus::Pending | TaskStatus::Running => 1,
    }
}

/// Write every snapshot of `task_id` to `out` until the task finishes and
/// return the last one.
pub async fn stream_progress(
    manager: &TaskManager,
    task_id: &str,
    out: &mut impl Write,
) -> Result<ProgressRecord> {
    let mut stream = manager.subscribe(task_id)?;
    let mut last = None;
    while let Some(record) = stream.next().await {
        let line = serde_json::to_string(&record).context("failed to serialize progress")?;
        writeln!(out, "{line}").context("failed to write progress")?;
        out.flush().ok();
        last = Some(record);
    }

    match last {
        Some(record) => Ok(record),
        None => manager
            .get_task(task_id)
            .context("task disappeared before finishing"),
    }
}

/// Stop the task the way a user interrupt should: cancel it if it is running,
/// withdraw it if it is still queued.
pub fn interrupt(manager: &TaskManager, task_id: &str) {
    match manager.cancel_task(task_id) {
        Ok(outcome) => {
            tracing::info!(task_id, strategy = %outcome.strategy, "cancellation requested");
        }
        Err(TaskError::InvalidState {
            status: TaskStatus::Pending,
            ..
        }) => {
            if let Err(e) = manager.withdraw_task(task_id) {
                tracing::warn!(task_id, error = %e, "failed to withdraw queued task");
            }
        }
        Err(e) => tracing::debug!(task_id, error = %e, "nothing to cancel"),
    }
}

/// Run the command and exit with the task's outcome.
pub async fn run_task(manager: TaskManager, request: TaskRequest) -> Result<()> {
    let kind = request.kind;
    let created = manager.create_task(request).await?;
    let task_id = created.task_id.to_string();
    match created.status {
        CreateStatus::Started => eprintln!("Running {kind} task {task_id}"),
        CreateStatus::Queued => eprintln!(
            "Queued {kind} task {task_id} at position {}",
            created.position.unwrap_or_default()
        ),
    }

    // First signal cancels, second force-exits.
    let got_first_signal = Arc::new(AtomicBool::new(false));
    {
        let manager = manager.clone();
        let task_id = task_id.clone();
        let got_first = Arc::clone(&got_first_signal);
        tokio::spawn(async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                if got_first.swap(true, Ordering::SeqCst) {
                    eprintln!("\nForce exit.");
                    std::process::exit(130);
                }
                eprintln!("\nCancelling (Ctrl+C again to force)...");
                interrupt(&manager, &task_id);
            }
        });
    }

    let last = stream_progress(&manager, &task_id, &mut std::io::stdout()).await?;
    manager.shutdown();

    match last.status {
        TaskStatus::Completed => eprintln!(
            "Task completed: {} succeeded, {} failed.",
            last.succeeded, last.failed
        ),
        TaskStatus::Failed => {
            let reason = last.errors.last().map(|e| e.error.as_str()).unwrap_or("unknown error");
            eprintln!("Task failed: {reason}");
        }
        _ => eprintln!("Task {}.", last.status),
    }
    std::process::exit(exit_code(last.status));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
