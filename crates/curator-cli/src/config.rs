//! Configuration file management for curator.
//!
//! Provides a TOML-based config file at `~/.config/curator/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use curator_core::admission::SettingsSource;
use curator_model::{SchedulerConfig, TaskKind};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Subprocess workers keyed by task kind (`library_scan`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workers: BTreeMap<String, WorkerSection>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_tasks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_grace_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the curator config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/curator` or `~/.config/curator`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("curator");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("curator")
}

/// Return the path to the curator config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file. Returns an error if it does not exist.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_config(&contents)
}

fn parse_config(contents: &str) -> Result<ConfigFile> {
    toml::from_str(contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    save_config_to(&config_path(), config)
}

pub fn save_config_to(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Where the effective parallelism limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Flag,
    Env,
    File,
    Default,
}

/// A subprocess worker bound to a task kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub kind: TaskKind,
    pub command: String,
    pub args: Vec<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct CuratorConfig {
    pub scheduler: SchedulerConfig,
    pub limit_source: LimitSource,
    pub workers: Vec<WorkerSpec>,
    pub config_path: PathBuf,
}

impl CuratorConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Parallelism: `cli_max` > `CURATOR_MAX_PARALLEL_TASKS` > `scheduler.max_parallel_tasks` > 2
    /// - Cleanup grace: `CURATOR_CLEANUP_GRACE_SECS` > `scheduler.cleanup_grace_secs` > 300s
    /// - Workers: `[workers.<kind>]` sections of the config file
    pub fn resolve(cli_max: Option<usize>) -> Result<Self> {
        let path = config_path();
        let file = if path.exists() {
            Some(load_config_from(&path)?)
        } else {
            None
        };
        let mut resolved =
            Self::resolve_from(cli_max, file.as_ref(), |key| std::env::var(key).ok())?;
        resolved.config_path = path;
        Ok(resolved)
    }

    /// Resolve against an explicit config file and environment lookup.
    pub fn resolve_from(
        cli_max: Option<usize>,
        file: Option<&ConfigFile>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let section = file.map(|f| f.scheduler.clone()).unwrap_or_default();
        let env_max = lookup(SchedulerConfig::MAX_PARALLEL_ENV)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|n| *n >= 1);

        let (max_parallel_tasks, limit_source) = if let Some(n) = cli_max {
            if n == 0 {
                anyhow::bail!("--max-parallel-tasks must be at least 1");
            }
            (n, LimitSource::Flag)
        } else if let Some(n) = env_max {
            (n, LimitSource::Env)
        } else if let Some(n) = section.max_parallel_tasks.filter(|n| *n >= 1) {
            (n, LimitSource::File)
        } else {
            (SchedulerConfig::DEFAULT_MAX_PARALLEL_TASKS, LimitSource::Default)
        };

        let cleanup_grace = lookup(SchedulerConfig::CLEANUP_GRACE_ENV)
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .or(section.cleanup_grace_secs)
            .map(Duration::from_secs)
            .unwrap_or(SchedulerConfig::DEFAULT_CLEANUP_GRACE);

        let mut workers = Vec::new();
        if let Some(file) = file {
            for (name, worker) in &file.workers {
                let kind: TaskKind = name
                    .parse()
                    .with_context(|| format!("unknown task kind in [workers.{name}]"))?;
                workers.push(WorkerSpec {
                    kind,
                    command: worker.command.clone(),
                    args: worker.args.clone(),
                });
            }
        }

        Ok(Self {
            scheduler: SchedulerConfig::new(max_parallel_tasks, cleanup_grace),
            limit_source,
            workers,
            config_path: config_path(),
        })
    }

    /// A limit given by flag or env must not be replaced by the file value.
    pub fn limit_is_pinned(&self) -> bool {
        matches!(self.limit_source, LimitSource::Flag | LimitSource::Env)
    }
}

// -----------------------------------------------------------------------
// Settings source
// -----------------------------------------------------------------------

/// Reads and persists the parallelism limit in the config file.
#[derive(Debug, Clone)]
pub struct FileSettingsSource {
    path: PathBuf,
    read_limit: bool,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_limit: true,
        }
    }

    /// Persist changes but never read the limit back.
    pub fn store_only(mut self) -> Self {
        self.read_limit = false;
        self
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn load_max_parallel_tasks(&self) -> Result<Option<usize>> {
        if !self.read_limit {
            return Ok(None);
        }
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| {
                        format!("failed to read config file at {}", self.path.display())
                    });
            }
        };
        Ok(parse_config(&contents)?.scheduler.max_parallel_tasks)
    }

    async fn store_max_parallel_tasks(&self, max: usize) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut config = if path.exists() {
                load_config_from(&path)?
            } else {
                ConfigFile::default()
            };
            config.scheduler.max_parallel_tasks = Some(max);
            save_config_to(&path, &config)
        })
        .await
        .context("settings writer panicked")?
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
