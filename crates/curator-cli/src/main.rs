mod config;
mod run_cmd;
mod serve_cmd;
#[cfg(test)]
mod test_util;
mod units;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use curator_core::TaskManager;
use curator_model::TaskKind;

use config::{CuratorConfig, FileSettingsSource};

#[derive(Parser)]
#[command(name = "curator", about = "Background task scheduler for a media library")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a curator config file
    Init {
        /// Maximum number of tasks running at once
        #[arg(long, default_value_t = curator_model::SchedulerConfig::DEFAULT_MAX_PARALLEL_TASKS)]
        max_parallel_tasks: usize,
        /// Seconds a finished task stays visible before eviction
        #[arg(long)]
        cleanup_grace_secs: Option<u64>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Serve the task API over HTTP
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8420)]
        port: u16,
        /// Maximum number of tasks running at once (overrides config)
        #[arg(long)]
        max_parallel_tasks: Option<usize>,
    },
    /// Run one task in the foreground, printing progress as JSON lines
    Run {
        /// Task kind: library_scan, metadata_refresh, media_analysis
        kind: String,
        /// Human-readable title
        #[arg(long)]
        title: Option<String>,
        /// Library folder (repeatable)
        #[arg(long = "path")]
        paths: Vec<PathBuf>,
        /// Media file to analyze
        #[arg(long)]
        media_file_id: Option<String>,
    },
}

/// Execute the `curator init` command: write config file.
fn cmd_init(
    max_parallel_tasks: usize,
    cleanup_grace_secs: Option<u64>,
    force: bool,
) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    if max_parallel_tasks == 0 {
        anyhow::bail!("--max-parallel-tasks must be at least 1");
    }

    let cfg = config::ConfigFile {
        scheduler: config::SchedulerSection {
            max_parallel_tasks: Some(max_parallel_tasks),
            cleanup_grace_secs,
        },
        workers: Default::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  scheduler.max_parallel_tasks = {max_parallel_tasks}");
    if let Some(secs) = cleanup_grace_secs {
        println!("  scheduler.cleanup_grace_secs = {secs}");
    }
    println!();
    println!("Add [workers.<kind>] sections to run a kind in a subprocess.");

    Ok(())
}

fn build_manager(resolved: &CuratorConfig) -> TaskManager {
    let mut settings = FileSettingsSource::new(&resolved.config_path);
    if resolved.limit_is_pinned() {
        settings = settings.store_only();
    }
    TaskManager::with_settings(
        resolved.scheduler.clone(),
        units::build_units(&resolved.workers),
        Arc::new(settings),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            max_parallel_tasks,
            cleanup_grace_secs,
            force,
        } => {
            cmd_init(max_parallel_tasks, cleanup_grace_secs, force)?;
        }
        Commands::Serve {
            bind,
            port,
            max_parallel_tasks,
        } => {
            let resolved = CuratorConfig::resolve(max_parallel_tasks)?;
            let manager = build_manager(&resolved);
            serve_cmd::run_serve(manager, &bind, port).await?;
        }
        Commands::Run {
            kind,
            title,
            paths,
            media_file_id,
        } => {
            let kind: TaskKind = kind
                .parse()
                .with_context(|| format!("invalid task kind: {kind}"))?;
            let resolved = CuratorConfig::resolve(None)?;
            let manager = build_manager(&resolved);
            let request = run_cmd::build_request(
                kind,
                run_cmd::RunOptions {
                    title,
                    paths,
                    media_file_id,
                },
            );
            run_cmd::run_task(manager, request).await?;
        }
    }

    Ok(())
}
