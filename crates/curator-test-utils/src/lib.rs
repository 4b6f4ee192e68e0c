//! Shared test utilities for curator integration tests.
//!
//! Scripted units of work with predictable timing, plus polling helpers
//! for waiting on task state without sleeping a fixed amount.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use curator_core::TaskManager;
use curator_core::unit::{CooperativeUnit, IsolatedUnit, TaskContext, UnitRegistry};
use curator_core::worker::{WorkerContext, WorkerMessage};
use curator_model::{ProgressDelta, ProgressRecord, SchedulerConfig, TaskStatus};

/// How long the polling helpers wait before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A scheduler config with a short eviction grace, so tests can observe it.
pub fn test_config(max_parallel_tasks: usize) -> SchedulerConfig {
    SchedulerConfig::new(max_parallel_tasks, Duration::from_millis(200))
}

/// A manager with no registered kinds; tests submit units directly.
pub fn test_manager(max_parallel_tasks: usize) -> TaskManager {
    TaskManager::new(test_config(max_parallel_tasks), UnitRegistry::new())
}

// ---------------------------------------------------------------------------
// Polling helpers
// ---------------------------------------------------------------------------

/// Poll until `check` returns `Some`, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until the task reaches `status` and return that snapshot.
pub async fn wait_for_status(
    manager: &TaskManager,
    task_id: &str,
    status: TaskStatus,
) -> ProgressRecord {
    wait_until(&format!("task {task_id} to be {status}"), || {
        manager.get_task(task_id).ok().filter(|p| p.status == status)
    })
    .await
}

/// Wait until the task reaches any terminal status.
pub async fn wait_for_terminal(manager: &TaskManager, task_id: &str) -> ProgressRecord {
    wait_until(&format!("task {task_id} to finish"), || {
        manager.get_task(task_id).ok().filter(|p| p.is_terminal())
    })
    .await
}

/// Wait until the task has been evicted from the registry.
pub async fn wait_for_eviction(manager: &TaskManager, task_id: &str) {
    wait_until(&format!("task {task_id} to be evicted"), || {
        manager.get_task(task_id).is_err().then_some(())
    })
    .await
}

// ---------------------------------------------------------------------------
// Cooperative units
// ---------------------------------------------------------------------------

/// A cooperative unit that processes `steps` items with a fixed delay,
/// checking for cancellation before each one.
#[derive(Debug, Clone)]
pub struct StepUnit {
    steps: u64,
    delay: Duration,
    failing_items: Vec<u64>,
    fatal_at: Option<u64>,
}

impl StepUnit {
    pub fn new(steps: u64, delay: Duration) -> Self {
        Self {
            steps,
            delay,
            failing_items: Vec::new(),
            fatal_at: None,
        }
    }

    /// Item `index` (0-based) is recorded as an item-level failure.
    pub fn failing_item(mut self, index: u64) -> Self {
        self.failing_items.push(index);
        self
    }

    /// Return an error when reaching item `index`.
    pub fn fatal_at(mut self, index: u64) -> Self {
        self.fatal_at = Some(index);
        self
    }
}

#[async_trait]
impl CooperativeUnit for StepUnit {
    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<()> {
        ctx.set_total(self.steps);
        for i in 0..self.steps {
            if ctx.checkpoint().await {
                return Ok(());
            }
            if self.fatal_at == Some(i) {
                anyhow::bail!("step {i} hit a fatal error");
            }
            tokio::time::sleep(self.delay).await;
            let item = format!("item-{i}");
            if self.failing_items.contains(&i) {
                ctx.item_failed(item, "unreadable");
            } else {
                ctx.advance(ProgressDelta::item_succeeded().with_current_item(item));
            }
        }
        Ok(())
    }
}

/// Records the order in which gated units start.
#[derive(Debug, Clone, Default)]
pub struct StartLog(Arc<Mutex<Vec<String>>>);

impl StartLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, label: &str) {
        self.0.lock().unwrap().push(label.to_owned());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Releases a [`GateUnit`].
#[derive(Debug, Clone)]
pub struct Gate(Arc<Notify>);

impl Gate {
    pub fn open(&self) {
        self.0.notify_one();
    }
}

/// A cooperative unit that logs its start, then waits until its gate is
/// opened or cancellation is requested.
#[derive(Debug)]
pub struct GateUnit {
    label: String,
    log: StartLog,
    gate: Arc<Notify>,
}

impl GateUnit {
    pub fn new(label: &str, log: &StartLog) -> (Self, Gate) {
        let gate = Arc::new(Notify::new());
        (
            Self {
                label: label.to_owned(),
                log: log.clone(),
                gate: Arc::clone(&gate),
            },
            Gate(gate),
        )
    }
}

#[async_trait]
impl CooperativeUnit for GateUnit {
    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<()> {
        self.log.push(&self.label);
        tokio::select! {
            _ = self.gate.notified() => {
                ctx.advance(ProgressDelta::item_succeeded());
            }
            _ = ctx.cancelled() => {}
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Isolated units
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Send(WorkerMessage),
    Sleep(Duration),
    Hang,
}

#[derive(Debug, Clone)]
enum Exit {
    Ok,
    Err(String),
    Panic,
}

/// Set when a [`ScriptedWorker`]'s future is dropped before finishing.
#[derive(Debug, Clone, Default)]
pub struct DropFlag(Arc<AtomicBool>);

impl DropFlag {
    pub fn was_dropped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct DropGuard {
    flag: DropFlag,
    armed: bool,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.0.store(true, Ordering::SeqCst);
        }
    }
}

/// An isolated unit that plays back a script of messages and pauses.
#[derive(Debug, Clone)]
pub struct ScriptedWorker {
    steps: Vec<Step>,
    exit: Exit,
    dropped: DropFlag,
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            exit: Exit::Ok,
            dropped: DropFlag::default(),
        }
    }

    pub fn send(mut self, message: WorkerMessage) -> Self {
        self.steps.push(Step::Send(message));
        self
    }

    pub fn progress(self, delta: ProgressDelta) -> Self {
        self.send(WorkerMessage::progress(delta))
    }

    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Sleep(duration));
        self
    }

    /// Never finish; only termination ends it.
    pub fn hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }

    pub fn exit_with_error(mut self, reason: &str) -> Self {
        self.exit = Exit::Err(reason.to_owned());
        self
    }

    pub fn panic_on_exit(mut self) -> Self {
        self.exit = Exit::Panic;
        self
    }

    pub fn drop_flag(&self) -> DropFlag {
        self.dropped.clone()
    }
}

#[async_trait]
impl IsolatedUnit for ScriptedWorker {
    async fn run(self: Box<Self>, ctx: WorkerContext) -> Result<()> {
        let mut guard = DropGuard {
            flag: self.dropped.clone(),
            armed: true,
        };
        for step in self.steps {
            match step {
                Step::Send(message) => ctx.send(message).await?,
                Step::Sleep(duration) => tokio::time::sleep(duration).await,
                Step::Hang => std::future::pending::<()>().await,
            }
        }
        guard.armed = false;
        match self.exit {
            Exit::Ok => Ok(()),
            Exit::Err(reason) => Err(anyhow::anyhow!(reason)),
            Exit::Panic => panic!("scripted worker panic"),
        }
    }
}
