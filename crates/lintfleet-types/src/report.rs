//! Analyzer result records, failure records, and the run summary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::batch::WorkerId;
use crate::protocol::FailureKind;

/// One per-file diagnostic record produced by the analyzer.
///
/// The record is opaque: it is carried and persisted verbatim, and only the
/// two aggregate counters are ever read out of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileReport(serde_json::Value);

impl FileReport {
    pub fn from_record(record: serde_json::Value) -> Self {
        Self(record)
    }

    pub fn error_count(&self) -> u64 {
        self.0
            .get("errorCount")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    pub fn warning_count(&self) -> u64 {
        self.0
            .get("warningCount")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    /// The raw record, for persistence.
    pub fn record(&self) -> &serde_json::Value {
        &self.0
    }
}

/// A file the run could not analyze, with the classified reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: FailureKind,
    pub message: String,
}

/// Per-worker statistics for the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    /// Number of files in the batch this worker handled.
    pub files: usize,
    pub peak_rss: u64,
    pub duration_ms: u64,
}

/// The consolidated outcome of a run, persisted as `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_files: usize,
    pub processed_files: usize,
    pub failed_files: usize,
    pub total_errors: u64,
    pub total_warnings: u64,
    pub workers: Vec<WorkerRecord>,
    pub failures: Vec<FailedFile>,
}

impl Summary {
    /// A run succeeded when nothing ended up in the failure list.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_report_reads_only_the_counters() {
        let report = FileReport::from_record(json!({
            "filePath": "/repo/src/a.ts",
            "errorCount": 2,
            "warningCount": 5,
            "messages": [{"ruleId": "no-unused-vars", "severity": 1}],
        }));
        assert_eq!(report.error_count(), 2);
        assert_eq!(report.warning_count(), 5);
    }

    #[test]
    fn file_report_missing_counters_default_to_zero() {
        let report = FileReport::from_record(json!({"filePath": "/repo/src/a.ts"}));
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.warning_count(), 0);
    }

    #[test]
    fn file_report_is_transparent_on_the_wire() {
        let record = json!({"filePath": "x.ts", "errorCount": 1, "warningCount": 0});
        let report = FileReport::from_record(record.clone());
        assert_eq!(serde_json::to_value(&report).unwrap(), record);
    }

    #[test]
    fn summary_serializes_spec_field_names() {
        let summary = Summary {
            total_files: 10,
            processed_files: 9,
            failed_files: 1,
            total_errors: 3,
            total_warnings: 7,
            workers: vec![WorkerRecord {
                worker_id: WorkerId(0),
                files: 9,
                peak_rss: 1024,
                duration_ms: 42,
            }],
            failures: vec![FailedFile {
                path: PathBuf::from("/repo/src/bad.ts"),
                reason: FailureKind::Oom,
                message: "killed".into(),
            }],
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["processedFiles"], 9);
        assert_eq!(json["failedFiles"], 1);
        assert_eq!(json["failures"][0]["reason"], "oom");
        assert!(!summary.is_clean());
    }
}
