//! Shared data model for the curator task core.
//!
//! Holds the progress record every task exposes, its wire serialization, and
//! the scheduler configuration defaults.

pub mod config;
pub mod models;

pub use config::SchedulerConfig;
pub use models::{
    AnalysisExtension, CancelStrategy, ErrorEntry, ProgressDelta, ProgressRecord, ScanExtension,
    ScanPhase, TaskCounts, TaskExtension, TaskId, TaskKind, TaskStatus,
};
