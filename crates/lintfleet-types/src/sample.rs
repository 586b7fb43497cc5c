//! Memory samples as recorded in worker timelines.

use serde::{Deserialize, Serialize};

use crate::batch::WorkerId;

/// One point on a worker's memory timeline, as observed by the master.
///
/// Persisted in `worker-<id>-memory.json`. The raw samples a process takes
/// of itself live in lintfleet-core; this is the cross-process record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub worker_id: WorkerId,
    pub rss_bytes: u64,
    pub heap_used_bytes: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}
