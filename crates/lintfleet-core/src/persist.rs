//! Persisted artifacts and the final summary.
//!
//! Layout under the output directory:
//!
//! - `summary.json`: the consolidated [`Summary`]
//! - `master-memory.json`: the orchestrator's own memory timeline
//! - `worker-<id>-results.json`: opaque analyzer records per worker
//! - `worker-<id>-memory.json`: that worker's memory timeline

use std::path::{Path, PathBuf};

use serde::Serialize;

use lintfleet_types::{FailedFile, FileReport, Summary, WorkerId, WorkerRecord};

use crate::error::{CoreError, CoreResult};

/// Path scheme for one run's artifacts.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    root: PathBuf,
}

impl OutputPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join("summary.json")
    }

    pub fn master_memory(&self) -> PathBuf {
        self.root.join("master-memory.json")
    }

    pub fn worker_results(&self, id: WorkerId) -> PathBuf {
        self.root.join(format!("worker-{id}-results.json"))
    }

    pub fn worker_memory(&self, id: WorkerId) -> PathBuf {
        self.root.join(format!("worker-{id}-memory.json"))
    }

    /// Shared counter used by the oom-single injection scenario.
    pub fn oom_counter(&self) -> PathBuf {
        self.root.join("oom-injections")
    }
}

/// Write a value as pretty-printed JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    let body = serde_json::to_vec_pretty(value).map_err(CoreError::Codec)?;
    std::fs::write(path, body).map_err(|e| CoreError::io(path, e))
}

/// Compute the run totals from the terminal sinks.
///
/// `processed_files` counts analyzer records; `total_files` is the batch
/// sizes of successful workers plus the failure count; together they
/// account for every discovered file exactly once.
pub fn build_summary(
    completed: &[(WorkerId, Vec<FileReport>)],
    worker_stats: Vec<WorkerRecord>,
    failures: Vec<FailedFile>,
) -> Summary {
    let processed_files: usize = completed.iter().map(|(_, r)| r.len()).sum();
    let total_errors: u64 = completed
        .iter()
        .flat_map(|(_, r)| r.iter())
        .map(FileReport::error_count)
        .sum();
    let total_warnings: u64 = completed
        .iter()
        .flat_map(|(_, r)| r.iter())
        .map(FileReport::warning_count)
        .sum();
    let handled: usize = worker_stats.iter().map(|w| w.files).sum();
    let failed_files = failures.len();

    Summary {
        total_files: handled + failed_files,
        processed_files,
        failed_files,
        total_errors,
        total_warnings,
        workers: worker_stats,
        failures,
    }
}

/// Print the human-readable end-of-run report.
pub fn print_report(summary: &Summary) {
    println!();
    println!("lint run complete");
    println!("  files:    {} total, {} processed, {} failed",
        summary.total_files, summary.processed_files, summary.failed_files);
    println!("  findings: {} errors, {} warnings",
        summary.total_errors, summary.total_warnings);
    println!("  workers:  {}", summary.workers.len());
    for w in &summary.workers {
        println!(
            "    worker {:>3}  {:>4} files  peak rss {:>8}  {} ms",
            w.worker_id,
            w.files,
            format_bytes(w.peak_rss),
            w.duration_ms
        );
    }
    if !summary.failures.is_empty() {
        println!("  failures:");
        for f in &summary.failures {
            println!("    {} [{}] {}", f.path.display(), f.reason, f.message);
        }
    }
}

/// Human-readable byte counts for the report.
fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;
    if bytes >= GIB {
        format!("{:.2}GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1}MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1}KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes}B")
    }
}
