//! Wire-shape tests for the progress record.
//!
//! Consumers read these records from the HTTP layer and the SSE stream, so
//! the field names and presence rules are pinned here.

use curator_model::{
    AnalysisExtension, ErrorEntry, ProgressDelta, ProgressRecord, ScanExtension, ScanPhase,
    TaskExtension, TaskId, TaskKind, TaskStatus,
};
use serde_json::json;

fn scan_record() -> ProgressRecord {
    ProgressRecord::new(
        TaskId::from("task-1"),
        TaskKind::LibraryScan,
        None,
        Some("Scan: Movies".to_owned()),
    )
}

#[test]
fn pending_record_shape() {
    let value = scan_record().to_json().unwrap();

    assert_eq!(value["taskId"], "task-1");
    assert_eq!(value["type"], "library_scan");
    assert_eq!(value["title"], "Scan: Movies");
    assert_eq!(value["status"], "pending");
    assert_eq!(value["total"], 0, "unknown total serializes as 0");
    assert_eq!(value["processed"], 0);
    assert_eq!(value["errors"], json!([]));
    assert!(value["startedAt"].is_string());
    assert!(value.get("completedAt").is_none());
    assert!(value.get("currentItem").is_none());
}

#[test]
fn untitled_record_omits_title() {
    let record = ProgressRecord::new(TaskId::generate(), TaskKind::MetadataRefresh, Some(5), None);
    let value = record.to_json().unwrap();
    assert!(value.get("title").is_none());
    assert_eq!(value["total"], 5);
    assert_eq!(value["type"], "metadata_refresh");
}

#[test]
fn scan_extension_is_flattened() {
    let mut record = scan_record();
    record.status = TaskStatus::Running;
    record.apply_delta(&ProgressDelta::item_succeeded().with_current_item("/movies/a.mkv"));
    record.extension = Some(TaskExtension::Scan(ScanExtension {
        phase: ScanPhase::Processing,
        folders_scanned: 3,
        files_discovered: 12,
    }));

    let value = record.to_json().unwrap();
    assert_eq!(value["phase"], "processing");
    assert_eq!(value["foldersScanned"], 3);
    assert_eq!(value["filesDiscovered"], 12);
    assert_eq!(value["currentItem"], "/movies/a.mkv");
    assert_eq!(value["status"], "running");
}

#[test]
fn analysis_extension_is_flattened() {
    let mut record =
        ProgressRecord::new(TaskId::from("probe"), TaskKind::MediaAnalysis, Some(1), None);
    record.extension = Some(TaskExtension::Analysis(AnalysisExtension {
        media_file_id: "mf-9".to_owned(),
        stage: None,
    }));

    let value = record.to_json().unwrap();
    assert_eq!(value["mediaFileId"], "mf-9");
    assert!(value.get("stage").is_none());
}

#[test]
fn errors_serialize_in_order() {
    let mut record = scan_record();
    record.errors.push(ErrorEntry::new("a.mkv", "unreadable"));
    record.errors.push(ErrorEntry::new("task", "disk went away"));

    let value = record.to_json().unwrap();
    assert_eq!(
        value["errors"],
        json!([
            {"item": "a.mkv", "error": "unreadable"},
            {"item": "task", "error": "disk went away"},
        ])
    );
}

#[test]
fn delta_deserializes_with_defaults() {
    let delta: ProgressDelta = serde_json::from_value(json!({"succeeded": 1})).unwrap();
    assert_eq!(delta.succeeded, 1);
    assert_eq!(delta.processed, 0);
    assert!(delta.current_item.is_none());
}
