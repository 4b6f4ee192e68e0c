//! The task manager: one facade over registry, admission, workers,
//! cancellation and streaming.
//!
//! ```text
//! create_task -> registry.insert(pending) -> admission
//!                                              |-- started: mark running, spawn unit
//!                                              `-- queued: wait for a free slot
//! terminal hook -> admission.on_task_finished -> cancellation.remove
//!               -> registry.schedule_cleanup(grace)
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use curator_model::{
    CancelStrategy, ProgressRecord, SchedulerConfig, TaskCounts, TaskId, TaskKind, TaskStatus,
};

use crate::admission::{Admission, AdmissionController, RunFn, SettingsSource};
use crate::cancel::{CancelOutcome, CancellationRegistry};
use crate::error::{TaskError, TaskResult};
use crate::registry::TaskRegistry;
use crate::stream::{ProgressGateway, ProgressStream};
use crate::tracker::TaskTracker;
use crate::unit::{TaskWork, UnitRegistry, spawn_cooperative};
use crate::worker::WorkerManager;

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// A request to start a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Kind-specific parameters, interpreted by the unit factory.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskRequest {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            title: None,
            total: None,
            params: serde_json::Value::Null,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStatus {
    Started,
    Queued,
}

/// Response to a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTask {
    pub task_id: TaskId,
    pub status: CreateStatus,
    /// 1-based queue position when queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    registry: Arc<TaskRegistry>,
    admission: AdmissionController,
    workers: WorkerManager,
    cancellations: CancellationRegistry,
    gateway: ProgressGateway,
    units: UnitRegistry,
    settings: Option<Arc<dyn SettingsSource>>,
    cleanup_grace: Duration,
}

impl Inner {
    fn on_terminal(self: &Arc<Self>, record: &ProgressRecord) {
        let task_id = &record.task_id;
        self.admission.on_task_finished(task_id);
        self.cancellations.remove(task_id.as_str());
        self.registry
            .schedule_cleanup(task_id.clone(), self.cleanup_grace);
    }
}

/// Cheap to clone; every clone drives the same set of tasks.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(config: SchedulerConfig, units: UnitRegistry) -> Self {
        Self::build(config, units, None)
    }

    /// A manager whose parallelism limit is read lazily from `settings`
    /// and written back when changed at runtime.
    pub fn with_settings(
        config: SchedulerConfig,
        units: UnitRegistry,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self::build(config, units, Some(settings))
    }

    fn build(
        config: SchedulerConfig,
        units: UnitRegistry,
        settings: Option<Arc<dyn SettingsSource>>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new());
        let admission = match &settings {
            Some(source) => {
                AdmissionController::with_settings(config.max_parallel_tasks, Arc::clone(source))
            }
            None => AdmissionController::new(config.max_parallel_tasks),
        };
        Self {
            inner: Arc::new(Inner {
                gateway: ProgressGateway::new(Arc::clone(&registry)),
                registry,
                admission,
                workers: WorkerManager::new(),
                cancellations: CancellationRegistry::new(),
                units,
                settings,
                cleanup_grace: config.cleanup_grace,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Build the unit for `request` and admit it.
    pub async fn create_task(&self, request: TaskRequest) -> TaskResult<CreatedTask> {
        let factory = self
            .inner
            .units
            .get(request.kind)
            .ok_or(TaskError::UnitUnavailable(request.kind))?;
        let work = factory
            .build(&request)
            .map_err(|e| TaskError::InvalidRequest(format!("{e:#}")))?;
        self.create_task_with_work(request.kind, request.title, request.total, work)
            .await
    }

    /// Admit an already-built unit.
    pub async fn create_task_with_work(
        &self,
        kind: TaskKind,
        title: Option<String>,
        total: Option<u64>,
        work: TaskWork,
    ) -> TaskResult<CreatedTask> {
        self.inner.admission.load_settings().await;

        let task_id = TaskId::generate();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let tracker = TaskTracker::with_terminal_hook(
            task_id.clone(),
            kind,
            total,
            title,
            Box::new(move |record| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_terminal(record);
                }
            }),
        );
        self.inner.registry.insert(Arc::clone(&tracker));
        let cancel = self.inner.cancellations.register(&task_id);

        let run = self.start_fn(tracker, work, cancel);
        let created = match self.inner.admission.queue_task_run(task_id.clone(), run) {
            Admission::Started => CreatedTask {
                task_id,
                status: CreateStatus::Started,
                position: None,
            },
            Admission::Queued { position } => CreatedTask {
                task_id,
                status: CreateStatus::Queued,
                position: Some(position),
            },
        };
        info!(
            task_id = %created.task_id,
            kind = %kind,
            status = ?created.status,
            position = ?created.position,
            "task created"
        );
        Ok(created)
    }

    fn start_fn(
        &self,
        tracker: Arc<TaskTracker>,
        work: TaskWork,
        cancel: CancellationToken,
    ) -> RunFn {
        match work {
            TaskWork::Cooperative(unit) => Box::new(move || {
                if let Err(e) = tracker.mark_running() {
                    warn!(task_id = %tracker.task_id(), error = %e, "not starting task");
                    return false;
                }
                spawn_cooperative(tracker, unit, cancel);
                true
            }),
            TaskWork::Isolated(unit) => {
                let workers = self.inner.workers.clone();
                Box::new(move || {
                    let task_id = tracker.task_id().clone();
                    let marker = Arc::clone(&tracker);
                    workers.run_in_worker(task_id, tracker, unit, move || {
                        match marker.mark_running() {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(task_id = %marker.task_id(), error = %e, "not starting task");
                                false
                            }
                        }
                    })
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_task(&self, task_id: &str) -> TaskResult<ProgressRecord> {
        self.tracker(task_id).map(|t| t.progress())
    }

    pub fn active_tasks(&self) -> Vec<ProgressRecord> {
        self.inner.registry.active_tasks()
    }

    pub fn all_tasks(&self) -> Vec<ProgressRecord> {
        self.inner.registry.all_tasks()
    }

    pub fn task_counts(&self) -> TaskCounts {
        self.inner.registry.task_counts()
    }

    /// 1-based position of a queued task, `None` once it has started.
    pub fn queue_position(&self, task_id: &str) -> Option<usize> {
        self.inner.admission.queue_position(&TaskId::from(task_id))
    }

    /// Whether an isolated worker is currently running for the task.
    pub fn is_worker_active(&self, task_id: &str) -> bool {
        self.inner.workers.is_worker_active(task_id)
    }

    /// Stream of snapshots for one task.
    pub fn subscribe(&self, task_id: &str) -> TaskResult<ProgressStream> {
        self.inner.gateway.open(task_id)
    }

    fn tracker(&self, task_id: &str) -> TaskResult<Arc<TaskTracker>> {
        self.inner
            .registry
            .get(task_id)
            .ok_or_else(|| TaskError::not_found(task_id))
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a running task.
    ///
    /// Worker-isolated tasks are terminated and marked cancelled at once.
    /// Cooperative tasks get their flag raised and stop at their next
    /// checkpoint. Tasks that are pending or finished are rejected.
    pub fn cancel_task(&self, task_id: &str) -> TaskResult<CancelOutcome> {
        let tracker = self.tracker(task_id)?;
        let status = tracker.status();
        if status != TaskStatus::Running {
            return Err(TaskError::InvalidState {
                task_id: tracker.task_id().clone(),
                status,
            });
        }

        let strategy = self.stop_running(&tracker)?;
        info!(task_id, strategy = %strategy, "cancellation requested");
        Ok(CancelOutcome {
            task_id: tracker.task_id().clone(),
            strategy,
        })
    }

    /// Terminate the task's worker or raise its cancellation flag. Fails
    /// when the task turns out to have finished already.
    fn stop_running(&self, tracker: &TaskTracker) -> TaskResult<CancelStrategy> {
        let task_id = tracker.task_id().as_str();
        self.inner.cancellations.request_cancellation(task_id);
        let strategy = if self.inner.workers.terminate_worker(task_id) {
            CancelStrategy::Forced
        } else {
            CancelStrategy::Cooperative
        };
        let still_running = match strategy {
            CancelStrategy::Forced => tracker.cancel(),
            CancelStrategy::Cooperative => tracker.status() == TaskStatus::Running,
        };
        // The task may have finished on its own since the check above.
        if !still_running {
            return Err(TaskError::InvalidState {
                task_id: tracker.task_id().clone(),
                status: tracker.status(),
            });
        }
        Ok(strategy)
    }

    /// Remove a task that is still waiting for a slot, so it never starts.
    pub fn withdraw_task(&self, task_id: &str) -> TaskResult<ProgressRecord> {
        let tracker = self.tracker(task_id)?;
        if !self.inner.admission.remove_queued(tracker.task_id()) {
            return Err(TaskError::InvalidState {
                task_id: tracker.task_id().clone(),
                status: tracker.status(),
            });
        }
        tracker.cancel();
        info!(task_id, "queued task withdrawn");
        Ok(tracker.progress())
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn max_parallel_tasks(&self) -> usize {
        self.inner.admission.load_settings().await;
        self.inner.admission.max_parallel_tasks()
    }

    /// Change the parallelism limit and persist it when a settings source
    /// is attached. Failing to persist is logged; the new limit still holds.
    pub async fn set_max_parallel_tasks(&self, max: usize) -> TaskResult<()> {
        self.inner.admission.set_max_parallel_tasks(max)?;
        if let Some(source) = &self.inner.settings {
            if let Err(e) = source.store_max_parallel_tasks(max).await {
                warn!(error = %e, "failed to persist max parallel tasks");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop everything: withdraw queued tasks, terminate workers and ask
    /// cooperative units to stop. Returns how many tasks were affected.
    pub fn shutdown(&self) -> usize {
        let mut affected = 0;
        for task_id in self.inner.admission.drain_queue() {
            if let Some(tracker) = self.inner.registry.get(task_id.as_str()) {
                tracker.cancel();
                affected += 1;
            }
        }
        for task_id in self.inner.workers.terminate_all() {
            if let Some(tracker) = self.inner.registry.get(task_id.as_str()) {
                tracker.cancel();
                affected += 1;
            }
        }
        affected += self.inner.cancellations.cancel_all();
        info!(affected, "task manager shutting down");
        affected
    }

    pub fn units(&self) -> &UnitRegistry {
        &self.inner.units
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("registry", &self.inner.registry)
            .field("admission", &self.inner.admission)
            .field("workers", &self.inner.workers)
            .finish()
    }
}
