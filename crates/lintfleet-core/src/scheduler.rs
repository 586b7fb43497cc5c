//! The orchestrator: a single-threaded event reactor over worker processes.
//!
//! All scheduler state lives in an owned [`SchedulerState`] mutated only
//! inside event handlers; nothing else holds a reference. State transitions
//! happen in response to three event classes: an inbound IPC message, a
//! worker exit, or the master sampler tick. After every event the spawn
//! loop runs again, so admission is re-evaluated whenever anything changes.
//!
//! Per-worker ordering is structural: one task per worker drains the IPC
//! stream to EOF, then waits on the process, then emits the exit event.
//! A worker whose `result` arrives just before its exit can therefore
//! never be misread as a failure.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use futures::StreamExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lintfleet_types::{
    initial_partition, Batch, BatchIdGen, FailedFile, FailureKind, FileReport, MasterMessage,
    MemorySample, Summary, WorkerId, WorkerIdGen, WorkerMessage, WorkerRecord,
};

use crate::admission::AdmissionController;
use crate::classify::{self, ExitSummary};
use crate::config::{self, RunConfig, TestScenario};
use crate::discover::{discover_files, GlobPattern};
use crate::error::{CoreError, CoreResult};
use crate::ipc::{self, IpcSink, IpcStream, WorkerChannel};
use crate::memory::{self, MemorySampler};
use crate::persist::{self, OutputPaths};

/// Everything the master tracks about one live worker.
struct WorkerState {
    batch: Batch,
    pid: Option<u32>,
    samples: Vec<MemorySample>,
    /// Set once a terminal `result` or `error` has been processed, so the
    /// later exit notification cannot resolve the batch twice.
    resolved: bool,
    io_task: JoinHandle<()>,
}

/// The owned scheduler state. Pending batches and active workers are
/// disjoint views of in-flight work; completed, failed, and worker_stats
/// are terminal sinks.
struct SchedulerState {
    pending: VecDeque<Batch>,
    active: HashMap<WorkerId, WorkerState>,
    completed: Vec<(WorkerId, Vec<FileReport>)>,
    failed: Vec<FailedFile>,
    worker_stats: Vec<WorkerRecord>,
    batch_ids: BatchIdGen,
    worker_ids: WorkerIdGen,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            active: HashMap::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            worker_stats: Vec::new(),
            batch_ids: BatchIdGen::new(),
            worker_ids: WorkerIdGen::new(),
        }
    }
}

/// Events delivered to the reactor. One mpsc carries them all, so events
/// from a single worker arrive in send order.
enum WorkerEvent {
    Inbound(WorkerId, WorkerMessage),
    /// A frame that did not decode; classified as `unknown`.
    Malformed(WorkerId, String),
    Exited(WorkerId, ExitSummary),
}

pub struct Orchestrator {
    config: RunConfig,
    admission: AdmissionController,
    worker_program: PathBuf,
    analyzer_config: PathBuf,
    paths: OutputPaths,
    state: SchedulerState,
    sampler: MemorySampler,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> CoreResult<Self> {
        let admission = AdmissionController::from_config(&config);
        let worker_program = config.resolve_worker_program()?;
        let paths = OutputPaths::new(&config.output_dir);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            admission,
            worker_program,
            analyzer_config: PathBuf::new(),
            paths,
            state: SchedulerState::new(),
            sampler: MemorySampler::new(),
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    /// Drive the whole run: discover, partition, schedule, recover,
    /// aggregate. Errors escape only from startup validation; every
    /// runtime failure becomes a `FailedFile` in the summary.
    pub async fn run(mut self) -> CoreResult<Summary> {
        std::fs::create_dir_all(&self.config.output_dir)
            .map_err(|e| CoreError::io(&self.config.output_dir, e))?;
        self.analyzer_config =
            config::prepare_config(&self.config.target, &self.config.output_dir)?;

        if self.config.scenario != TestScenario::None {
            // Fresh injection counter per run.
            std::fs::write(self.paths.oom_counter(), b"")
                .map_err(|e| CoreError::io(self.paths.oom_counter(), e))?;
        }

        let pattern = GlobPattern::new(&self.config.glob)?;
        let files = discover_files(&self.config.target, &pattern).await?;
        info!(
            files = files.len(),
            glob = %self.config.glob,
            target = %self.config.target.display(),
            "discovered input files"
        );

        self.state.pending = initial_partition(
            files,
            self.config.initial_divisor,
            &mut self.state.batch_ids,
        )
        .into();
        info!(batches = self.state.pending.len(), "partitioned into batches");

        let mut events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| CoreError::Protocol("orchestrator already ran".into()))?;

        self.sampler.start(self.config.master_sample_interval, None);
        self.pump_pending().await;

        let mut tick = tokio::time::interval(self.config.master_sample_interval);
        while !(self.state.pending.is_empty() && self.state.active.is_empty()) {
            tokio::select! {
                Some(event) = events_rx.recv() => self.handle_event(event).await,
                _ = tick.tick() => {}
            }
            self.pump_pending().await;
        }

        self.sampler.stop();
        Ok(self.finalize())
    }

    /// The spawn loop: while admission allows, move the longest-waiting
    /// batch from pending to a fresh worker.
    async fn pump_pending(&mut self) {
        loop {
            if self.state.pending.is_empty() {
                break;
            }
            let observed = memory::current_rss_bytes() + self.observed_worker_rss();
            if !self.admission.can_spawn(self.state.active.len(), observed) {
                debug!(
                    active = self.state.active.len(),
                    observed_rss = observed,
                    "admission gate closed"
                );
                break;
            }
            let Some(batch) = self.state.pending.pop_front() else {
                break;
            };
            if let Err(e) = self.spawn_worker(&batch).await {
                error!(batch = %batch.id, error = %e, "failed to spawn worker");
                self.state
                    .failed
                    .extend(batch.files.iter().map(|path| FailedFile {
                        path: path.clone(),
                        reason: FailureKind::Unknown,
                        message: format!("spawn failed: {e}"),
                    }));
            }
        }
    }

    /// Sum of the last-known RSS of every active worker. Workers without
    /// a sample yet contribute zero.
    fn observed_worker_rss(&self) -> u64 {
        self.state
            .active
            .values()
            .filter_map(|w| w.samples.last())
            .map(|s| s.rss_bytes)
            .sum()
    }

    async fn spawn_worker(&mut self, batch: &Batch) -> CoreResult<()> {
        let worker_id = self.state.worker_ids.next_id();
        let channel = WorkerChannel::pair()?;
        let (framed, child_end) = channel.into_parts();

        let mut cmd = Command::new(&self.worker_program);
        cmd.arg("worker")
            .env("TEST_SCENARIO", self.config.scenario.to_string())
            .env("TEST_TARGET_FILE", &self.config.test_file)
            .env("TEST_OOM_RETRIES", self.config.oom_retries.to_string())
            .env("LINTFLEET_ANALYZER", &self.config.analyzer_program)
            .env("LINTFLEET_STATE_DIR", &self.config.output_dir)
            .env(
                "LINTFLEET_SAMPLE_INTERVAL_MS",
                self.config.worker_sample_interval.as_millis().to_string(),
            );
        ipc::wire_child(&mut cmd, &child_end);

        let child = cmd.spawn().map_err(CoreError::Spawn)?;
        drop(child_end);
        let pid = child.id();

        let (mut sink, stream) = framed.split();
        let lint = MasterMessage::Lint {
            worker_id,
            config_path: self.analyzer_config.clone(),
            files: batch.files.clone(),
            target_path: Some(self.config.target.clone()),
        };
        ipc::send_frame(&mut sink, &lint).await?;

        let io_task = tokio::spawn(worker_io(
            worker_id,
            sink,
            stream,
            child,
            self.events_tx.clone(),
        ));

        info!(
            worker = %worker_id,
            batch = %batch.id,
            files = batch.files.len(),
            retries = batch.retries,
            pid,
            "spawned worker"
        );
        self.state.active.insert(
            worker_id,
            WorkerState {
                batch: batch.clone(),
                pid,
                samples: Vec::new(),
                resolved: false,
                io_task,
            },
        );
        Ok(())
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Inbound(id, WorkerMessage::Memory { rss, heap_used, timestamp, .. }) => {
                if let Some(ws) = self.state.active.get_mut(&id) {
                    ws.samples.push(MemorySample {
                        worker_id: id,
                        rss_bytes: rss,
                        heap_used_bytes: heap_used,
                        timestamp_ms: timestamp,
                    });
                }
            }
            WorkerEvent::Inbound(id, WorkerMessage::Result { results, peak_rss, duration_ms, .. }) => {
                let files = match self.state.active.get_mut(&id) {
                    None => return,
                    Some(ws) => {
                        if ws.resolved {
                            warn!(worker = %id, "second terminal message ignored");
                            return;
                        }
                        ws.resolved = true;
                        ws.batch.files.len()
                    }
                };
                info!(
                    worker = %id,
                    results = results.len(),
                    peak_rss,
                    duration_ms,
                    "worker reported results"
                );
                self.state.worker_stats.push(WorkerRecord {
                    worker_id: id,
                    files,
                    peak_rss,
                    duration_ms,
                });
                self.state.completed.push((id, results));
            }
            WorkerEvent::Inbound(id, WorkerMessage::Error { error_type, message, file, .. }) => {
                self.resolve_failure(id, error_type, &message, file);
            }
            WorkerEvent::Malformed(id, detail) => {
                self.resolve_failure(
                    id,
                    FailureKind::Unknown,
                    &format!("unrecognized worker message: {detail}"),
                    None,
                );
            }
            WorkerEvent::Exited(id, exit) => self.handle_exit(id, exit).await,
        }
    }

    /// Apply the recovery policy to a reported (or inferred) failure.
    fn resolve_failure(
        &mut self,
        id: WorkerId,
        kind: FailureKind,
        message: &str,
        file: Option<PathBuf>,
    ) {
        let batch = match self.state.active.get_mut(&id) {
            None => return,
            Some(ws) => {
                if ws.resolved {
                    return;
                }
                ws.resolved = true;
                ws.batch.clone()
            }
        };
        warn!(worker = %id, error_type = %kind, message, "worker failure");
        self.apply_recovery(&batch, kind, message, file);
    }

    fn apply_recovery(&mut self, batch: &Batch, kind: FailureKind, message: &str, file: Option<PathBuf>) {
        let recovery = classify::recover(
            batch,
            kind,
            message,
            file.as_deref(),
            self.config.max_retries,
            &mut self.state.batch_ids,
        );
        for child in &recovery.requeue {
            info!(
                parent = %batch.id,
                batch = %child.id,
                files = child.files.len(),
                retries = child.retries,
                "requeueing batch"
            );
        }
        self.state.pending.extend(recovery.requeue);
        self.state.failed.extend(recovery.failed);
    }

    async fn handle_exit(&mut self, id: WorkerId, exit: ExitSummary) {
        let Some(ws) = self.state.active.remove(&id) else {
            return;
        };
        // The io task emitted this event as its last act; reap it so
        // nothing detached outlives finalization.
        let _ = ws.io_task.await;

        if let Err(e) = persist::write_json(&self.paths.worker_memory(id), &ws.samples) {
            warn!(worker = %id, error = %e, "failed to persist worker memory timeline");
        }

        if ws.resolved {
            debug!(worker = %id, pid = ?ws.pid, code = ?exit.code, "worker exited after terminal message");
            return;
        }

        if exit.is_oom() {
            warn!(worker = %id, error_type = %FailureKind::Oom, "worker killed (out of memory)");
            self.apply_recovery(&ws.batch, FailureKind::Oom, "worker killed (out of memory)", None);
        } else if !exit.is_success() {
            let message = match (exit.code, exit.signal) {
                (Some(code), _) => format!("worker exited with status {code}"),
                (None, Some(signal)) => format!("worker killed by signal {signal}"),
                (None, None) => "worker exit status unavailable".to_string(),
            };
            warn!(worker = %id, error_type = %FailureKind::Unknown, message, "worker failure");
            self.apply_recovery(&ws.batch, FailureKind::Unknown, &message, None);
        } else {
            // Clean exit but no terminal message ever arrived.
            let message = "worker exited without reporting a result";
            warn!(worker = %id, error_type = %FailureKind::Unknown, message, "worker failure");
            self.apply_recovery(&ws.batch, FailureKind::Unknown, message, None);
        }
    }

    /// Persist everything and build the summary. Persist failures are
    /// logged, not raised: the aggregator always runs to completion.
    fn finalize(&mut self) -> Summary {
        for (id, results) in &self.state.completed {
            if let Err(e) = persist::write_json(&self.paths.worker_results(*id), results) {
                warn!(worker = %id, error = %e, "failed to persist worker results");
            }
        }
        if let Err(e) = persist::write_json(&self.paths.master_memory(), &self.sampler.timeline())
        {
            warn!(error = %e, "failed to persist master memory timeline");
        }

        let summary = persist::build_summary(
            &self.state.completed,
            std::mem::take(&mut self.state.worker_stats),
            std::mem::take(&mut self.state.failed),
        );
        if let Err(e) = persist::write_json(&self.paths.summary(), &summary) {
            warn!(error = %e, "failed to persist summary");
        }
        persist::print_report(&summary);
        summary
    }
}

/// Per-worker IO: drain frames until EOF, then reap the process and emit
/// the exit event. Keeping both in one task guarantees that everything a
/// worker sent is delivered before its exit notification.
async fn worker_io(
    worker_id: WorkerId,
    sink: IpcSink,
    mut stream: IpcStream,
    mut child: tokio::process::Child,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    // The task was sent at spawn; the master never writes again.
    drop(sink);

    loop {
        match ipc::next_frame::<WorkerMessage>(&mut stream).await {
            Ok(Some(msg)) => {
                let _ = events.send(WorkerEvent::Inbound(worker_id, msg));
            }
            Ok(None) => break,
            Err(CoreError::Codec(e)) => {
                let _ = events.send(WorkerEvent::Malformed(worker_id, e.to_string()));
            }
            Err(e) => {
                warn!(worker = %worker_id, error = %e, "ipc read failed");
                break;
            }
        }
    }

    let exit = match child.wait().await {
        Ok(status) => ExitSummary::from(status),
        Err(e) => {
            warn!(worker = %worker_id, error = %e, "failed to reap worker");
            ExitSummary {
                code: None,
                signal: None,
            }
        }
    };
    let _ = events.send(WorkerEvent::Exited(worker_id, exit));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str) -> RunConfig {
        let root = std::env::temp_dir().join(format!(
            "lintfleet-sched-{}-{}",
            name,
            std::process::id()
        ));
        std::fs::create_dir_all(&root).unwrap();
        let mut config = RunConfig::new(&root);
        config.worker_program = Some(PathBuf::from("/bin/true"));
        config
    }

    fn dummy_worker(batch: Batch) -> WorkerState {
        WorkerState {
            batch,
            pid: None,
            samples: Vec::new(),
            resolved: false,
            io_task: tokio::spawn(async {}),
        }
    }

    fn batch_of(files: &[&str], retries: u32, ids: &mut BatchIdGen) -> Batch {
        Batch {
            id: ids.next_id(),
            files: files.iter().map(PathBuf::from).collect(),
            retries,
        }
    }

    #[tokio::test]
    async fn oom_exit_bisects_and_requeues() {
        let mut orch = Orchestrator::new(test_config("oom")).unwrap();
        let batch = batch_of(&["a", "b", "c"], 0, &mut orch.state.batch_ids);
        let id = orch.state.worker_ids.next_id();
        orch.state.active.insert(id, dummy_worker(batch));

        orch.handle_exit(
            id,
            ExitSummary {
                code: Some(137),
                signal: None,
            },
        )
        .await;

        assert!(orch.state.active.is_empty());
        assert_eq!(orch.state.pending.len(), 2);
        assert_eq!(orch.state.pending[0].files.len(), 2);
        assert_eq!(orch.state.pending[1].files.len(), 1);
        assert!(orch.state.failed.is_empty());
    }

    #[tokio::test]
    async fn resolved_worker_exit_is_a_success_even_with_kill_status() {
        let mut orch = Orchestrator::new(test_config("race")).unwrap();
        let batch = batch_of(&["a"], 0, &mut orch.state.batch_ids);
        let id = orch.state.worker_ids.next_id();
        let mut ws = dummy_worker(batch);
        ws.resolved = true;
        orch.state.active.insert(id, ws);

        orch.handle_exit(
            id,
            ExitSummary {
                code: None,
                signal: Some(libc::SIGKILL),
            },
        )
        .await;

        assert!(orch.state.pending.is_empty());
        assert!(orch.state.failed.is_empty());
    }

    #[tokio::test]
    async fn result_message_moves_batch_to_completed() {
        let mut orch = Orchestrator::new(test_config("result")).unwrap();
        let batch = batch_of(&["a", "b"], 0, &mut orch.state.batch_ids);
        let id = orch.state.worker_ids.next_id();
        orch.state.active.insert(id, dummy_worker(batch));

        orch.handle_event(WorkerEvent::Inbound(
            id,
            WorkerMessage::Result {
                worker_id: id,
                results: vec![
                    FileReport::from_record(serde_json::json!({"errorCount": 1, "warningCount": 0})),
                    FileReport::from_record(serde_json::json!({"errorCount": 0, "warningCount": 2})),
                ],
                peak_rss: 42,
                duration_ms: 7,
            },
        ))
        .await;

        assert_eq!(orch.state.completed.len(), 1);
        assert_eq!(orch.state.worker_stats.len(), 1);
        assert_eq!(orch.state.worker_stats[0].files, 2);
        assert!(orch.state.active.get(&id).unwrap().resolved);

        // Subsequent clean exit changes nothing.
        orch.handle_exit(
            id,
            ExitSummary {
                code: Some(0),
                signal: None,
            },
        )
        .await;
        assert!(orch.state.failed.is_empty());
        assert_eq!(orch.state.completed.len(), 1);
    }

    #[tokio::test]
    async fn memory_messages_feed_the_admission_sum() {
        let mut orch = Orchestrator::new(test_config("memory")).unwrap();
        let batch = batch_of(&["a"], 0, &mut orch.state.batch_ids);
        let id = orch.state.worker_ids.next_id();
        orch.state.active.insert(id, dummy_worker(batch));

        assert_eq!(orch.observed_worker_rss(), 0);

        for rss in [100, 250, 200] {
            orch.handle_event(WorkerEvent::Inbound(
                id,
                WorkerMessage::Memory {
                    worker_id: id,
                    rss,
                    heap_used: 0,
                    timestamp: rss,
                },
            ))
            .await;
        }

        // Admission sees the last sample, not the peak.
        assert_eq!(orch.observed_worker_rss(), 200);
        assert_eq!(orch.state.active.get(&id).unwrap().samples.len(), 3);
    }

    #[tokio::test]
    async fn error_message_applies_recovery_once() {
        let mut orch = Orchestrator::new(test_config("error")).unwrap();
        let batch = batch_of(&["a", "bad", "c"], 0, &mut orch.state.batch_ids);
        let id = orch.state.worker_ids.next_id();
        orch.state.active.insert(id, dummy_worker(batch));

        orch.handle_event(WorkerEvent::Inbound(
            id,
            WorkerMessage::Error {
                worker_id: id,
                error_type: FailureKind::ParseError,
                message: "Parsing error: Unexpected token".into(),
                file: Some(PathBuf::from("bad")),
            },
        ))
        .await;

        assert_eq!(orch.state.failed.len(), 1);
        assert_eq!(orch.state.failed[0].path, PathBuf::from("bad"));
        assert_eq!(orch.state.pending.len(), 1);
        assert_eq!(orch.state.pending[0].files.len(), 2);

        // The exit that follows must not double-apply recovery.
        orch.handle_exit(
            id,
            ExitSummary {
                code: Some(0),
                signal: None,
            },
        )
        .await;
        assert_eq!(orch.state.failed.len(), 1);
        assert_eq!(orch.state.pending.len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_fails_the_batch_as_unknown() {
        let mut orch = Orchestrator::new(test_config("malformed")).unwrap();
        let batch = batch_of(&["a", "b"], 0, &mut orch.state.batch_ids);
        let id = orch.state.worker_ids.next_id();
        orch.state.active.insert(id, dummy_worker(batch));

        orch.handle_event(WorkerEvent::Malformed(id, "unknown variant `telemetry`".into()))
            .await;

        assert_eq!(orch.state.failed.len(), 2);
        assert!(orch
            .state
            .failed
            .iter()
            .all(|f| f.reason == FailureKind::Unknown));
    }

    #[tokio::test]
    async fn clean_exit_without_result_is_unknown() {
        let mut orch = Orchestrator::new(test_config("silent")).unwrap();
        let batch = batch_of(&["a"], 0, &mut orch.state.batch_ids);
        let id = orch.state.worker_ids.next_id();
        orch.state.active.insert(id, dummy_worker(batch));

        orch.handle_exit(
            id,
            ExitSummary {
                code: Some(0),
                signal: None,
            },
        )
        .await;

        assert_eq!(orch.state.failed.len(), 1);
        assert_eq!(orch.state.failed[0].reason, FailureKind::Unknown);
    }
}
