//! Built-in cooperative library scan.
//!
//! Walks the library folders, collects media files, then checks each one.
//! Progress goes through three [`ScanPhase`]s and the scan stops at the
//! next folder or file boundary once cancellation is requested.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use curator_model::{ProgressDelta, ScanExtension, ScanPhase, TaskExtension, TaskKind};

use super::registry::UnitFactory;
use super::{CooperativeUnit, TaskContext, TaskWork};
use crate::manager::TaskRequest;

/// File extensions treated as media when a request does not list its own.
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "webm", "wmv", "ts", "m2ts", "mpg", "mpeg",
];

#[derive(Debug, Deserialize)]
struct ScanParams {
    paths: Vec<PathBuf>,
    #[serde(default)]
    extensions: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct LibraryScan {
    roots: Vec<PathBuf>,
    extensions: HashSet<String>,
}

impl LibraryScan {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(|e| (*e).to_owned())
                .collect(),
        }
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| {
                let e: String = e.into();
                e.trim_start_matches('.').to_ascii_lowercase()
            })
            .collect();
        self
    }

    /// Build from request params: `{"paths": [..], "extensions": [..]?}`.
    pub fn from_request(request: &TaskRequest) -> Result<Self> {
        let params: ScanParams = serde_json::from_value(request.params.clone())
            .context("library scan params must be {\"paths\": [...]}")?;
        if params.paths.is_empty() {
            bail!("library scan needs at least one path");
        }
        let scan = Self::new(params.paths);
        Ok(match params.extensions {
            Some(exts) => scan.with_extensions(exts),
            None => scan,
        })
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.contains(&e.to_ascii_lowercase()))
    }

    fn report(ctx: &TaskContext, phase: ScanPhase, folders: u64, files: u64) {
        ctx.set_extension(TaskExtension::Scan(ScanExtension {
            phase,
            folders_scanned: folders,
            files_discovered: files,
        }));
    }

    /// Returns `None` when cancelled mid-walk.
    async fn discover(&self, ctx: &TaskContext) -> Option<(u64, Vec<PathBuf>)> {
        let mut pending: Vec<PathBuf> = self.roots.iter().rev().cloned().collect();
        let mut files = Vec::new();
        let mut folders = 0u64;
        Self::report(ctx, ScanPhase::Discovering, 0, 0);

        while let Some(dir) = pending.pop() {
            if ctx.checkpoint().await {
                return None;
            }
            let label = dir.display().to_string();
            ctx.set_current_item(label.clone());

            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    ctx.tracker().add_error(label, format!("cannot read folder: {e}"));
                    continue;
                }
            };

            let mut subdirs = Vec::new();
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let path = entry.path();
                        match entry.file_type().await {
                            Ok(ft) if ft.is_dir() => subdirs.push(path),
                            Ok(ft) if ft.is_file() && self.is_media(&path) => files.push(path),
                            Ok(_) => {}
                            Err(e) => {
                                ctx.tracker()
                                    .add_error(path.display().to_string(), e.to_string());
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        ctx.tracker().add_error(label.clone(), e.to_string());
                        break;
                    }
                }
            }
            subdirs.sort();
            pending.extend(subdirs.into_iter().rev());

            folders += 1;
            Self::report(ctx, ScanPhase::Discovering, folders, files.len() as u64);
        }

        files.sort();
        Some((folders, files))
    }
}

#[async_trait]
impl CooperativeUnit for LibraryScan {
    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<()> {
        let Some((folders, files)) = self.discover(&ctx).await else {
            debug!(task_id = %ctx.task_id(), "scan cancelled during discovery");
            return Ok(());
        };
        let discovered = files.len() as u64;

        ctx.set_total(discovered);
        Self::report(&ctx, ScanPhase::Processing, folders, discovered);

        for file in &files {
            if ctx.checkpoint().await {
                debug!(task_id = %ctx.task_id(), "scan cancelled during processing");
                return Ok(());
            }
            let label = file.display().to_string();
            match tokio::fs::metadata(file).await {
                Ok(meta) if meta.len() == 0 => ctx.item_failed(label, "empty file"),
                Ok(_) => ctx.advance(ProgressDelta::item_succeeded().with_current_item(label)),
                Err(e) => ctx.item_failed(label, e.to_string()),
            }
        }

        Self::report(&ctx, ScanPhase::Finalizing, folders, discovered);
        Ok(())
    }
}

/// Registers [`LibraryScan`] for [`TaskKind::LibraryScan`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LibraryScanFactory;

impl UnitFactory for LibraryScanFactory {
    fn kind(&self) -> TaskKind {
        TaskKind::LibraryScan
    }

    fn build(&self, request: &TaskRequest) -> Result<TaskWork> {
        Ok(TaskWork::cooperative(LibraryScan::from_request(request)?))
    }
}
