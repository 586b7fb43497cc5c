//! The master/worker wire protocol.
//!
//! Four message kinds travel over the dedicated IPC channel, each tagged by
//! the `kind` discriminator: `lint` (master → worker) plus `result`,
//! `error`, and `memory` (worker → master). Messages are JSON records; the
//! framing layer lives in lintfleet-core.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::batch::WorkerId;
use crate::report::FileReport;

/// Why a batch (or a single file) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The host kernel killed the worker for exceeding its memory budget.
    Oom,
    /// The analyzer rejected a file for syntactic reasons.
    ParseError,
    /// An analyzer rule raised an exception.
    RuleCrash,
    /// Any other non-success exit or unclassified error text.
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Oom => "oom",
            FailureKind::ParseError => "parse_error",
            FailureKind::RuleCrash => "rule_crash",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Messages sent from the master to a worker.
///
/// A worker receives exactly one `lint` message for its whole lifetime; the
/// entire task travels in it, so workers inherit nothing implicitly from
/// the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MasterMessage {
    Lint {
        worker_id: WorkerId,
        config_path: PathBuf,
        files: Vec<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_path: Option<PathBuf>,
    },
}

/// Messages sent from a worker to the master.
///
/// `memory` is high-frequency and informational; `result` and `error` are
/// terminal: a worker sends at most one of them, then exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkerMessage {
    Result {
        worker_id: WorkerId,
        results: Vec<FileReport>,
        peak_rss: u64,
        duration_ms: u64,
    },
    Error {
        worker_id: WorkerId,
        error_type: FailureKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<PathBuf>,
    },
    Memory {
        worker_id: WorkerId,
        rss: u64,
        heap_used: u64,
        timestamp: u64,
    },
}
