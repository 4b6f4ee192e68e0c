//! Subprocess worker.
//!
//! Runs an external program whose stdout is a JSON-lines stream of
//! [`WorkerMessage`]s and forwards each one. The child is killed when the
//! worker future is dropped, so terminating the worker terminates the
//! process.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use curator_model::TaskKind;

use super::message::{WorkerContext, WorkerMessage};
use crate::manager::TaskRequest;
use crate::unit::{IsolatedUnit, TaskWork, UnitFactory};

/// Environment variable carrying the task id to the child.
pub const TASK_ID_ENV: &str = "CURATOR_TASK_ID";
/// Environment variable carrying the request params (JSON) to the child.
pub const TASK_PARAMS_ENV: &str = "CURATOR_TASK_PARAMS";

#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Parse one stdout line. Blank lines yield `Ok(None)`.
fn parse_line(line: &str) -> Result<Option<WorkerMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .context("malformed worker message")
}

#[async_trait]
impl IsolatedUnit for CommandWorker {
    async fn run(self: Box<Self>, ctx: WorkerContext) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(TASK_ID_ENV, ctx.task_id().as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn worker program '{}' -- is it installed and on PATH?",
                self.program
            )
        })?;
        debug!(
            task_id = %ctx.task_id(),
            program = %self.program,
            pid = ?child.id(),
            "worker process started"
        );

        let stdout = child
            .stdout
            .take()
            .context("worker process has no stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines
            .next_line()
            .await
            .context("error reading worker stdout")?
        {
            match parse_line(&line) {
                Ok(Some(message)) => ctx.send(message).await?,
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        task_id = %ctx.task_id(),
                        line = line.trim(),
                        error = %e,
                        "skipping malformed JSONL line"
                    );
                }
            }
        }

        let status = child
            .wait()
            .await
            .context("failed to wait for worker process")?;
        if !status.success() {
            bail!("worker process '{}' exited with {status}", self.program);
        }
        Ok(())
    }
}

/// Builds a [`CommandWorker`] for one task kind. The request params are
/// passed to the child as JSON in `CURATOR_TASK_PARAMS`.
#[derive(Debug, Clone)]
pub struct CommandWorkerFactory {
    kind: TaskKind,
    program: String,
    args: Vec<String>,
}

impl CommandWorkerFactory {
    pub fn new(kind: TaskKind, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind,
            program: program.into(),
            args,
        }
    }
}

impl UnitFactory for CommandWorkerFactory {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn build(&self, request: &TaskRequest) -> Result<TaskWork> {
        let params = serde_json::to_string(&request.params).context("unserializable task params")?;
        let worker = CommandWorker::new(self.program.clone())
            .args(self.args.iter().cloned())
            .env(TASK_PARAMS_ENV, params);
        Ok(TaskWork::isolated(worker))
    }
}
