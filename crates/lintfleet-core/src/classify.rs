//! Failure classification and the bisect-and-retry recovery policy.
//!
//! Classification is exhaustive at the master boundary: every worker
//! outcome maps to one of the four [`FailureKind`]s. Recovery turns a
//! classified failure into requeued sub-batches, failed files, or both.

use std::path::{Path, PathBuf};

use lintfleet_types::{Batch, BatchIdGen, FailedFile, FailureKind};

/// Exit code the kernel reports for a SIGKILLed process (128 + 9).
pub const OOM_EXIT_CODE: i32 = 137;

/// Message fragments the analyzer emits when a file fails to parse.
const PARSE_MARKERS: &[&str] = &["Parsing error", "ParserError", "Unexpected token"];

/// Message fragments produced when an analyzer rule throws.
const RULE_MARKERS: &[&str] = &["Error while loading rule", "Rule \"", "rule crashed"];

/// How a worker process ended, as observed by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitSummary {
    /// A forced kill or the 137 exit code both read as OOM.
    pub fn is_oom(&self) -> bool {
        self.signal == Some(libc::SIGKILL) || self.code == Some(OOM_EXIT_CODE)
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

#[cfg(unix)]
impl From<std::process::ExitStatus> for ExitSummary {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Classify an error message by its text.
pub fn classify_message(message: &str) -> FailureKind {
    if PARSE_MARKERS.iter().any(|m| message.contains(m)) {
        FailureKind::ParseError
    } else if RULE_MARKERS.iter().any(|m| message.contains(m)) {
        FailureKind::RuleCrash
    } else {
        FailureKind::Unknown
    }
}

/// What the scheduler should do with a classified failure.
///
/// `requeue` batches go to the tail of the pending queue; `failed` files
/// go to the terminal failure list. Either may be empty, never both.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub requeue: Vec<Batch>,
    pub failed: Vec<FailedFile>,
}

impl Recovery {
    fn fail_all(batch: &Batch, reason: FailureKind, message: &str) -> Self {
        Self {
            requeue: Vec::new(),
            failed: batch
                .files
                .iter()
                .map(|path| FailedFile {
                    path: path.clone(),
                    reason,
                    message: message.to_string(),
                })
                .collect(),
        }
    }
}

/// Apply the recovery policy to a classified `(batch, kind, message, file)`.
///
/// - OOM with retry budget and a splittable batch: bisect and requeue both
///   halves. OOM correlates with working-set size, so halving the input
///   reliably lowers peak RSS for parser-based analyzers.
/// - OOM otherwise: every file in the batch fails with reason `oom`.
/// - Parse error with an identified file: that file alone fails; the rest
///   of the batch is requeued as a fresh batch so no file is silently
///   dropped. The requeue terminates because each pass shrinks the set.
/// - Anything else (parse error without a file, rule crash, unknown):
///   the whole batch fails with that reason.
pub fn recover(
    batch: &Batch,
    kind: FailureKind,
    message: &str,
    file: Option<&Path>,
    max_retries: u32,
    ids: &mut BatchIdGen,
) -> Recovery {
    match kind {
        FailureKind::Oom => {
            if batch.retries < max_retries {
                if let Some((left, right)) = batch.bisect(ids) {
                    return Recovery {
                        requeue: vec![left, right],
                        failed: Vec::new(),
                    };
                }
            }
            Recovery::fail_all(batch, FailureKind::Oom, message)
        }
        FailureKind::ParseError => match file {
            Some(target) => {
                let failed = vec![FailedFile {
                    path: target.to_path_buf(),
                    reason: FailureKind::ParseError,
                    message: message.to_string(),
                }];
                let rest: Vec<PathBuf> = batch
                    .files
                    .iter()
                    .filter(|f| f.as_path() != target)
                    .cloned()
                    .collect();
                let requeue = if rest.is_empty() {
                    Vec::new()
                } else {
                    vec![Batch {
                        id: ids.next_id(),
                        files: rest,
                        retries: batch.retries,
                    }]
                };
                Recovery { requeue, failed }
            }
            None => Recovery::fail_all(batch, FailureKind::ParseError, message),
        },
        FailureKind::RuleCrash => Recovery::fail_all(batch, FailureKind::RuleCrash, message),
        FailureKind::Unknown => Recovery::fail_all(batch, FailureKind::Unknown, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(files: &[&str], retries: u32, ids: &mut BatchIdGen) -> Batch {
        Batch {
            id: ids.next_id(),
            files: files.iter().map(PathBuf::from).collect(),
            retries,
        }
    }

    #[test]
    fn sigkill_and_137_read_as_oom() {
        assert!(ExitSummary { code: None, signal: Some(libc::SIGKILL) }.is_oom());
        assert!(ExitSummary { code: Some(137), signal: None }.is_oom());
        assert!(!ExitSummary { code: Some(1), signal: None }.is_oom());
        assert!(!ExitSummary { code: Some(0), signal: None }.is_oom());
    }

    #[test]
    fn message_classification_table() {
        assert_eq!(
            classify_message("Parsing error: Unexpected token }"),
            FailureKind::ParseError
        );
        assert_eq!(
            classify_message("Error while loading rule 'no-undef'"),
            FailureKind::RuleCrash
        );
        assert_eq!(
            classify_message("Rule \"custom/foo\" errored on file"),
            FailureKind::RuleCrash
        );
        assert_eq!(classify_message("segfault in native module"), FailureKind::Unknown);
    }

    #[test]
    fn oom_with_budget_bisects_to_the_tail() {
        let mut ids = BatchIdGen::new();
        let b = batch(&["a", "b", "c", "d"], 0, &mut ids);
        let recovery = recover(&b, FailureKind::Oom, "killed", None, 2, &mut ids);

        assert!(recovery.failed.is_empty());
        assert_eq!(recovery.requeue.len(), 2);
        assert_eq!(recovery.requeue[0].files, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(recovery.requeue[1].files, vec![PathBuf::from("c"), PathBuf::from("d")]);
        assert_eq!(recovery.requeue[0].retries, 1);
    }

    #[test]
    fn oom_at_retry_bound_fails_every_file() {
        let mut ids = BatchIdGen::new();
        let b = batch(&["a", "b"], 2, &mut ids);
        let recovery = recover(&b, FailureKind::Oom, "killed", None, 2, &mut ids);

        assert!(recovery.requeue.is_empty());
        assert_eq!(recovery.failed.len(), 2);
        assert!(recovery.failed.iter().all(|f| f.reason == FailureKind::Oom));
    }

    #[test]
    fn oom_singleton_fails_immediately() {
        let mut ids = BatchIdGen::new();
        let b = batch(&["only"], 1, &mut ids);
        let recovery = recover(&b, FailureKind::Oom, "killed", None, 2, &mut ids);

        assert!(recovery.requeue.is_empty());
        assert_eq!(recovery.failed.len(), 1);
        assert_eq!(recovery.failed[0].path, PathBuf::from("only"));
    }

    #[test]
    fn identified_parse_error_isolates_one_file() {
        let mut ids = BatchIdGen::new();
        let b = batch(&["a", "bad", "c"], 0, &mut ids);
        let recovery = recover(
            &b,
            FailureKind::ParseError,
            "Parsing error",
            Some(Path::new("bad")),
            2,
            &mut ids,
        );

        assert_eq!(recovery.failed.len(), 1);
        assert_eq!(recovery.failed[0].path, PathBuf::from("bad"));
        assert_eq!(recovery.requeue.len(), 1);
        assert_eq!(
            recovery.requeue[0].files,
            vec![PathBuf::from("a"), PathBuf::from("c")]
        );
        // Not an OOM bisection: the retry depth carries over unchanged.
        assert_eq!(recovery.requeue[0].retries, 0);
    }

    #[test]
    fn identified_parse_error_on_singleton_requeues_nothing() {
        let mut ids = BatchIdGen::new();
        let b = batch(&["bad"], 0, &mut ids);
        let recovery = recover(
            &b,
            FailureKind::ParseError,
            "Parsing error",
            Some(Path::new("bad")),
            2,
            &mut ids,
        );
        assert!(recovery.requeue.is_empty());
        assert_eq!(recovery.failed.len(), 1);
    }

    #[test]
    fn unidentified_parse_error_fails_the_batch() {
        let mut ids = BatchIdGen::new();
        let b = batch(&["a", "b"], 0, &mut ids);
        let recovery = recover(&b, FailureKind::ParseError, "Parsing error", None, 2, &mut ids);
        assert!(recovery.requeue.is_empty());
        assert_eq!(recovery.failed.len(), 2);
    }

    #[test]
    fn rule_crash_fails_the_batch() {
        let mut ids = BatchIdGen::new();
        let b = batch(&["a", "b", "c"], 0, &mut ids);
        let recovery = recover(
            &b,
            FailureKind::RuleCrash,
            "Rule \"x\" errored",
            None,
            2,
            &mut ids,
        );
        assert_eq!(recovery.failed.len(), 3);
        assert!(recovery.failed.iter().all(|f| f.reason == FailureKind::RuleCrash));
    }

    #[test]
    fn retry_depth_never_exceeds_the_bound() {
        // Drive a batch through repeated OOMs; no surviving batch may
        // ever carry retries above max_retries.
        let mut ids = BatchIdGen::new();
        let mut queue = vec![batch(&["a", "b", "c", "d", "e", "f", "g", "h"], 0, &mut ids)];
        let max_retries = 2;

        while let Some(b) = queue.pop() {
            assert!(b.retries <= max_retries);
            let recovery = recover(&b, FailureKind::Oom, "killed", None, max_retries, &mut ids);
            for child in recovery.requeue {
                assert!(child.retries <= max_retries);
                queue.push(child);
            }
        }
    }
}
