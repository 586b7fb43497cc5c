//! Batch identification, partitioning, and bisection.
//!
//! A batch is the unit of work handed to a single worker process: an ordered,
//! non-empty list of files plus a retry depth. Batches are never mutated;
//! recovery replaces a failed batch with two freshly-numbered halves.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique identifier for a batch. Strictly increasing over a run, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a worker process. Distinct counter from [`BatchId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic generator for batch ids.
#[derive(Debug, Default)]
pub struct BatchIdGen {
    next: u64,
}

impl BatchIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> BatchId {
        let id = BatchId(self.next);
        self.next += 1;
        id
    }
}

/// Monotonic generator for worker ids.
#[derive(Debug, Default)]
pub struct WorkerIdGen {
    next: u64,
}

impl WorkerIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next);
        self.next += 1;
        id
    }
}

/// A unit of work for one worker: an ordered non-empty file list and a
/// retry depth counting how many bisections produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub files: Vec<PathBuf>,
    pub retries: u32,
}

impl Batch {
    /// Create a fresh batch at retry depth zero.
    pub fn new(id: BatchId, files: Vec<PathBuf>) -> Self {
        Self {
            id,
            files,
            retries: 0,
        }
    }

    /// Split this batch into two halves with incremented retry depth.
    ///
    /// The left half takes the ceiling of the midpoint so the halves
    /// concatenate back to the original file order. Returns `None` for a
    /// singleton batch, which cannot be split further.
    pub fn bisect(&self, ids: &mut BatchIdGen) -> Option<(Batch, Batch)> {
        if self.files.len() < 2 {
            return None;
        }
        let mid = self.files.len().div_ceil(2);
        let left = Batch {
            id: ids.next_id(),
            files: self.files[..mid].to_vec(),
            retries: self.retries + 1,
        };
        let right = Batch {
            id: ids.next_id(),
            files: self.files[mid..].to_vec(),
            retries: self.retries + 1,
        };
        Some((left, right))
    }
}

/// Partition the discovered file list into consecutive slices.
///
/// Slice length is `max(1, ceil(n / divisor))`; the final slice may be
/// shorter. An empty input yields no batches.
pub fn initial_partition(files: Vec<PathBuf>, divisor: usize, ids: &mut BatchIdGen) -> Vec<Batch> {
    if files.is_empty() {
        return Vec::new();
    }
    let divisor = divisor.max(1);
    let size = files.len().div_ceil(divisor).max(1);
    files
        .chunks(size)
        .map(|chunk| Batch::new(ids.next_id(), chunk.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn bisect_preserves_order_and_length() {
        let mut ids = BatchIdGen::new();
        let batch = Batch::new(ids.next_id(), paths(&["a", "b", "c", "d", "e"]));
        let (left, right) = batch.bisect(&mut ids).unwrap();

        assert_eq!(left.files, paths(&["a", "b", "c"]));
        assert_eq!(right.files, paths(&["d", "e"]));
        assert_eq!(left.files.len() + right.files.len(), batch.files.len());

        let mut rejoined = left.files.clone();
        rejoined.extend(right.files.clone());
        assert_eq!(rejoined, batch.files);
    }

    #[test]
    fn bisect_increments_retry_depth() {
        let mut ids = BatchIdGen::new();
        let mut batch = Batch::new(ids.next_id(), paths(&["a", "b"]));
        batch.retries = 1;
        let (left, right) = batch.bisect(&mut ids).unwrap();
        assert_eq!(left.retries, 2);
        assert_eq!(right.retries, 2);
    }

    #[test]
    fn bisect_singleton_is_impossible() {
        let mut ids = BatchIdGen::new();
        let batch = Batch::new(ids.next_id(), paths(&["only"]));
        assert!(batch.bisect(&mut ids).is_none());
    }

    #[test]
    fn bisect_two_files_yields_two_singletons() {
        let mut ids = BatchIdGen::new();
        let batch = Batch::new(ids.next_id(), paths(&["a", "b"]));
        let (left, right) = batch.bisect(&mut ids).unwrap();
        assert_eq!(left.files, paths(&["a"]));
        assert_eq!(right.files, paths(&["b"]));
    }

    #[test]
    fn bisect_assigns_fresh_ids() {
        let mut ids = BatchIdGen::new();
        let batch = Batch::new(ids.next_id(), paths(&["a", "b", "c"]));
        let (left, right) = batch.bisect(&mut ids).unwrap();
        assert!(left.id > batch.id);
        assert!(right.id > left.id);
    }

    #[test]
    fn partition_ten_files_divisor_four() {
        let mut ids = BatchIdGen::new();
        let files: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("f{i}"))).collect();
        let batches = initial_partition(files, 4, &mut ids);

        let sizes: Vec<usize> = batches.iter().map(|b| b.files.len()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn partition_fewer_files_than_divisor() {
        let mut ids = BatchIdGen::new();
        let batches = initial_partition(paths(&["a", "b"]), 4, &mut ids);
        let sizes: Vec<usize> = batches.iter().map(|b| b.files.len()).collect();
        assert_eq!(sizes, vec![1, 1]);
    }

    #[test]
    fn partition_empty_input() {
        let mut ids = BatchIdGen::new();
        assert!(initial_partition(Vec::new(), 4, &mut ids).is_empty());
    }

    #[test]
    fn partition_conserves_files() {
        let mut ids = BatchIdGen::new();
        let files: Vec<PathBuf> = (0..17).map(|i| PathBuf::from(format!("f{i}"))).collect();
        let batches = initial_partition(files.clone(), 4, &mut ids);

        let rejoined: Vec<PathBuf> = batches.into_iter().flat_map(|b| b.files).collect();
        assert_eq!(rejoined, files);
    }

    #[test]
    fn id_generators_are_strictly_increasing() {
        let mut batches = BatchIdGen::new();
        let mut workers = WorkerIdGen::new();
        let b: Vec<BatchId> = (0..5).map(|_| batches.next_id()).collect();
        let w: Vec<WorkerId> = (0..5).map(|_| workers.next_id()).collect();
        for pair in b.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for pair in w.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
