//! Admission control: a bounded running set plus a FIFO wait queue.
//!
//! The parallelism limit is read once, lazily, from a [`SettingsSource`]
//! and can be changed at runtime. Slot reservation, dequeueing and the call
//! to the start function all happen under one lock, so the running count
//! never exceeds the limit and tasks start in the order they arrived.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use curator_model::{SchedulerConfig, TaskId};

use crate::error::{TaskError, TaskResult};

/// Starts a task. Invoked inside the admission critical section, so it must
/// not call back into the [`AdmissionController`]. Returns `false` when the
/// task could not be started, which releases the slot again.
pub type RunFn = Box<dyn FnOnce() -> bool + Send>;

/// Outcome of [`AdmissionController::queue_task_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was reserved and the start function was invoked.
    Started,
    /// The task is waiting; `position` is 1-based.
    Queued { position: usize },
}

/// Where the persisted parallelism limit lives.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Read the configured limit. `Ok(None)` keeps the default.
    async fn load_max_parallel_tasks(&self) -> anyhow::Result<Option<usize>>;

    /// Persist a limit changed at runtime.
    async fn store_max_parallel_tasks(&self, _max: usize) -> anyhow::Result<()> {
        Ok(())
    }
}

struct AdmissionState {
    max_parallel_tasks: usize,
    /// Set once the limit has been changed explicitly; a later lazy load
    /// must not overwrite it.
    overridden: bool,
    running: HashSet<TaskId>,
    queue: VecDeque<(TaskId, RunFn)>,
}

impl AdmissionState {
    fn has_free_slot(&self) -> bool {
        self.running.len() < self.max_parallel_tasks
    }

    /// Start queued tasks, oldest first, while slots are free.
    fn promote(&mut self) {
        while self.has_free_slot() {
            let Some((task_id, run)) = self.queue.pop_front() else {
                break;
            };
            self.running.insert(task_id.clone());
            if run() {
                debug!(task_id = %task_id, "promoted queued task");
            } else {
                self.running.remove(&task_id);
                warn!(task_id = %task_id, "queued task could not start");
            }
        }
    }
}

pub struct AdmissionController {
    state: Mutex<AdmissionState>,
    settings: Option<Arc<dyn SettingsSource>>,
    loaded: OnceCell<()>,
}

impl AdmissionController {
    /// A controller with a fixed starting limit and no settings source.
    pub fn new(max_parallel_tasks: usize) -> Self {
        Self::build(max_parallel_tasks, None)
    }

    /// A controller that reads its limit from `settings` on first use,
    /// falling back to `default_max` when the source has nothing.
    pub fn with_settings(default_max: usize, settings: Arc<dyn SettingsSource>) -> Self {
        Self::build(default_max, Some(settings))
    }

    fn build(max_parallel_tasks: usize, settings: Option<Arc<dyn SettingsSource>>) -> Self {
        Self {
            state: Mutex::new(AdmissionState {
                max_parallel_tasks: max_parallel_tasks.max(1),
                overridden: false,
                running: HashSet::new(),
                queue: VecDeque::new(),
            }),
            settings,
            loaded: OnceCell::new(),
        }
    }

    pub fn is_settings_loaded(&self) -> bool {
        self.settings.is_none() || self.loaded.initialized()
    }

    /// Read the limit from the settings source. Runs at most once; later
    /// calls return immediately. Load failures keep the current limit.
    pub async fn load_settings(&self) {
        let Some(source) = self.settings.as_ref() else {
            return;
        };
        self.loaded
            .get_or_init(|| async {
                match source.load_max_parallel_tasks().await {
                    Ok(Some(max)) if max >= 1 => {
                        let mut state = self.state.lock();
                        if !state.overridden {
                            state.max_parallel_tasks = max;
                            state.promote();
                        }
                        debug!(max_parallel_tasks = max, "loaded admission settings");
                    }
                    Ok(Some(_)) => {
                        warn!("ignoring stored max parallel tasks of 0");
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "failed to load admission settings; keeping default");
                    }
                }
            })
            .await;
    }

    pub fn max_parallel_tasks(&self) -> usize {
        self.state.lock().max_parallel_tasks
    }

    /// Change the limit. Raising it starts waiting tasks at once; lowering
    /// it never interrupts running ones.
    pub fn set_max_parallel_tasks(&self, max: usize) -> TaskResult<()> {
        if max == 0 {
            return Err(TaskError::InvalidConfiguration(
                "max parallel tasks must be at least 1".to_owned(),
            ));
        }
        let mut state = self.state.lock();
        state.max_parallel_tasks = max;
        state.overridden = true;
        state.promote();
        info!(max_parallel_tasks = max, "admission limit updated");
        Ok(())
    }

    /// Whether a newly arriving task would start without waiting.
    pub fn can_run_immediately(&self) -> bool {
        let state = self.state.lock();
        state.has_free_slot() && state.queue.is_empty()
    }

    /// Start `run` now if a slot is free and nobody is waiting, otherwise
    /// append it to the queue.
    pub fn queue_task_run(&self, task_id: TaskId, run: RunFn) -> Admission {
        let mut state = self.state.lock();
        if state.has_free_slot() && state.queue.is_empty() {
            state.running.insert(task_id.clone());
            if !run() {
                state.running.remove(&task_id);
                warn!(task_id = %task_id, "task could not start");
            }
            Admission::Started
        } else {
            state.queue.push_back((task_id.clone(), run));
            let position = state.queue.len();
            debug!(task_id = %task_id, position, "task queued");
            Admission::Queued { position }
        }
    }

    /// Release `task_id`'s slot and start waiting tasks. Releasing an id
    /// that holds no slot does nothing.
    pub fn on_task_finished(&self, task_id: &TaskId) {
        let mut state = self.state.lock();
        if state.running.remove(task_id) {
            state.promote();
        }
    }

    /// Remove a waiting task without starting it.
    pub fn remove_queued(&self, task_id: &TaskId) -> bool {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|(id, _)| id != task_id);
        state.queue.len() != before
    }

    /// Remove every waiting task, returning their ids in queue order.
    pub fn drain_queue(&self) -> Vec<TaskId> {
        let mut state = self.state.lock();
        state.queue.drain(..).map(|(id, _)| id).collect()
    }

    /// 1-based position of a waiting task.
    pub fn queue_position(&self, task_id: &TaskId) -> Option<usize> {
        let state = self.state.lock();
        state
            .queue
            .iter()
            .position(|(id, _)| id == task_id)
            .map(|i| i + 1)
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.state.lock().running.contains(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(SchedulerConfig::DEFAULT_MAX_PARALLEL_TASKS)
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AdmissionController")
            .field("max_parallel_tasks", &state.max_parallel_tasks)
            .field("running", &state.running.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}
