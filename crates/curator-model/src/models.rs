use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque task identifier. Generated once at creation and used as the only
/// key across the registry, admission queue, and worker map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Borrow<str> for TaskId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
///
/// ```text
/// pending -> running -> completed | failed | cancelled
/// pending -> cancelled   (withdrawn from the admission queue)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is absorbing (no further mutation allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `to` is an edge of the status graph.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// How a running task is stopped when cancellation is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStrategy {
    /// The unit of work polls a flag between steps and stops itself.
    Cooperative,
    /// The isolated execution context is destroyed outright.
    Forced,
}

impl fmt::Display for CancelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooperative => f.write_str("cooperative"),
            Self::Forced => f.write_str("forced"),
        }
    }
}

// ---------------------------------------------------------------------------

/// The closed set of background task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Walk library folders and index media files.
    LibraryScan,
    /// Refresh provider metadata for catalog entries.
    MetadataRefresh,
    /// Probe media files for stream and quality information.
    MediaAnalysis,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [Self::LibraryScan, Self::MetadataRefresh, Self::MediaAnalysis];

    /// Default cancellation strategy for the kind. Scans and refreshes poll
    /// between steps; probes run in an isolated worker and are terminated.
    pub fn cancel_strategy(self) -> CancelStrategy {
        match self {
            Self::LibraryScan | Self::MetadataRefresh => CancelStrategy::Cooperative,
            Self::MediaAnalysis => CancelStrategy::Forced,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LibraryScan => "library_scan",
            Self::MetadataRefresh => "metadata_refresh",
            Self::MediaAnalysis => "media_analysis",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "library_scan" => Ok(Self::LibraryScan),
            "metadata_refresh" => Ok(Self::MetadataRefresh),
            "media_analysis" => Ok(Self::MediaAnalysis),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid task kind: {:?} (expected library_scan, metadata_refresh, or media_analysis)",
            self.0
        )
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------

/// Phase of a library scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Discovering,
    Processing,
    Finalizing,
}

// ---------------------------------------------------------------------------
// Kind-specific progress
// ---------------------------------------------------------------------------

/// Extra progress fields reported by library scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanExtension {
    pub phase: ScanPhase,
    #[serde(default)]
    pub folders_scanned: u64,
    #[serde(default)]
    pub files_discovered: u64,
}

/// Extra progress fields reported by media analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisExtension {
    pub media_file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// Kind-specific fields layered onto the base record. Serialized flat, so
/// the common fields keep their names regardless of kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskExtension {
    Scan(ScanExtension),
    Analysis(AnalysisExtension),
}

// ---------------------------------------------------------------------------
// Progress record
// ---------------------------------------------------------------------------

/// One item-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub item: String,
    pub error: String,
}

impl ErrorEntry {
    pub fn new(item: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            error: error.into(),
        }
    }
}

/// Counter increments merged into a record by a single `advance`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDelta {
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub succeeded: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
}

impl ProgressDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// One item processed successfully.
    pub fn item_succeeded() -> Self {
        Self {
            processed: 1,
            succeeded: 1,
            ..Self::default()
        }
    }

    /// One item processed with a failure.
    pub fn item_failed() -> Self {
        Self {
            processed: 1,
            failed: 1,
            ..Self::default()
        }
    }

    pub fn with_processed(mut self, n: u64) -> Self {
        self.processed = n;
        self
    }

    pub fn with_succeeded(mut self, n: u64) -> Self {
        self.succeeded = n;
        self
    }

    pub fn with_failed(mut self, n: u64) -> Self {
        self.failed = n;
        self
    }

    pub fn with_current_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }
}

/// The observable state of one task.
///
/// Serializes to the camelCase wire shape:
///
/// ```text
/// { taskId, type, title?, status, total, processed, succeeded, failed,
///   currentItem?, errors, startedAt, completedAt?, ...extension }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: TaskStatus,
    /// `None` until the unit of work knows how many items it has.
    #[serde(serialize_with = "serialize_total")]
    pub total: Option<u64>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    pub errors: Vec<ErrorEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extension: Option<TaskExtension>,
}

fn serialize_total<S: Serializer>(total: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(total.unwrap_or(0))
}

impl ProgressRecord {
    /// A fresh `pending` record stamped with the current time.
    pub fn new(task_id: TaskId, kind: TaskKind, total: Option<u64>, title: Option<String>) -> Self {
        Self {
            task_id,
            kind,
            title,
            status: TaskStatus::Pending,
            total,
            processed: 0,
            succeeded: 0,
            failed: 0,
            current_item: None,
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            extension: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge a delta into the counters.
    ///
    /// Returns `true` when the result had to be clamped to keep
    /// `processed <= total` and `succeeded + failed <= processed`.
    pub fn apply_delta(&mut self, delta: &ProgressDelta) -> bool {
        self.processed = self.processed.saturating_add(delta.processed);
        self.succeeded = self.succeeded.saturating_add(delta.succeeded);
        self.failed = self.failed.saturating_add(delta.failed);
        if let Some(item) = &delta.current_item {
            self.current_item = Some(item.clone());
        }
        self.enforce_counters()
    }

    /// Set (or revise) the total. Counters above the new total are clamped.
    pub fn set_total(&mut self, total: u64) -> bool {
        self.total = Some(total);
        self.enforce_counters()
    }

    fn enforce_counters(&mut self) -> bool {
        let mut clamped = false;

        // A resolved item has been processed, even if the caller did not say so.
        let resolved = self.succeeded.saturating_add(self.failed);
        if resolved > self.processed {
            self.processed = resolved;
        }

        if let Some(total) = self.total {
            if self.processed > total {
                self.processed = total;
                clamped = true;
            }
        }

        if self.succeeded > self.processed {
            self.succeeded = self.processed;
            clamped = true;
        }
        let room = self.processed - self.succeeded;
        if self.failed > room {
            self.failed = room;
            clamped = true;
        }

        clamped
    }

    /// Serialize to the JSON wire shape.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Per-status task counts over one registry snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl TaskCounts {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }
}

impl FromIterator<TaskStatus> for TaskCounts {
    fn from_iter<I: IntoIterator<Item = TaskStatus>>(iter: I) -> Self {
        let mut counts = Self::default();
        for status in iter {
            counts.record(status);
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
