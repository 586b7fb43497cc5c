//! The child-side worker driver.
//!
//! A worker lives through one batch: open the channel the master installed
//! at fd 3, block on the single `lint` task message, sample memory every
//! tick while the analyzer runs, then send exactly one terminal `result`
//! or `error` and exit 0. A real OOM is not observable from in here; the
//! kernel kills the process and the master infers the rest.
//!
//! Failure-injection scenarios live here too, gated on the scenario env
//! so they are unreachable in production runs.

use std::hash::{BuildHasher, Hasher};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use lintfleet_types::{FailureKind, MasterMessage, WorkerMessage};

use crate::analyzer::{Analyzer, AnalyzerError, CommandAnalyzer};
use crate::classify;
use crate::config::{TestScenario, DEFAULT_ANALYZER, DEFAULT_TEST_FILE};
use crate::error::{CoreError, CoreResult};
use crate::ipc::{self, IpcSink};
use crate::memory::{self, MemorySampler};

const SLOW_WORKER_DELAY: Duration = Duration::from_secs(5);

/// Worker-process settings, read from the environment the master set up.
///
/// The task itself (config path, file list) arrives over IPC; only the
/// ambient knobs travel by env.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub analyzer_program: PathBuf,
    pub sample_interval: Duration,
    pub injection: Injection,
}

impl WorkerSettings {
    pub fn from_env() -> Self {
        let analyzer_program = std::env::var("LINTFLEET_ANALYZER")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ANALYZER));
        let sample_interval = std::env::var("LINTFLEET_SAMPLE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(200));
        Self {
            analyzer_program,
            sample_interval,
            injection: Injection::from_env(),
        }
    }
}

/// What the injection layer decided before linting starts.
#[derive(Debug, Clone, PartialEq)]
pub enum Injected {
    /// No scenario applies; lint normally.
    Proceed,
    /// Sleep first, then lint normally.
    Delay(Duration),
    /// Die the way the kernel would kill us: exit 137, no message.
    Oom,
    /// Send this error as the terminal message instead of linting.
    Error {
        kind: FailureKind,
        message: String,
        file: Option<PathBuf>,
    },
}

/// Failure-injection configuration, plus the cross-process counter used
/// by `oom-single` (workers are separate processes, so the "how many
/// times have we died already" state lives in a file).
#[derive(Debug, Clone)]
pub struct Injection {
    scenario: TestScenario,
    target: String,
    oom_retries: u32,
    state_dir: PathBuf,
}

impl Injection {
    pub fn new(
        scenario: TestScenario,
        target: impl Into<String>,
        oom_retries: u32,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scenario,
            target: target.into(),
            oom_retries,
            state_dir: state_dir.into(),
        }
    }

    pub fn from_env() -> Self {
        let scenario = std::env::var("TEST_SCENARIO")
            .ok()
            .and_then(|v| TestScenario::parse(&v))
            .unwrap_or_default();
        let target = std::env::var("TEST_TARGET_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_TEST_FILE.to_string());
        let oom_retries = std::env::var("TEST_OOM_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let state_dir = std::env::var("LINTFLEET_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        Self::new(scenario, target, oom_retries, state_dir)
    }

    /// Decide what to inject for this batch. Pure with respect to the
    /// process: the only side effect is bumping the shared counter.
    pub fn evaluate(&self, files: &[PathBuf]) -> Injected {
        if self.scenario == TestScenario::None {
            return Injected::Proceed;
        }
        let matched = files
            .iter()
            .find(|f| f.to_string_lossy().contains(&self.target));

        match self.scenario {
            TestScenario::None => Injected::Proceed,
            TestScenario::OomSingle => match matched {
                // The first attempt and the next `oom_retries` retries all
                // die; after that the batch passes.
                Some(_) if self.bump_counter() <= u64::from(self.oom_retries) + 1 => Injected::Oom,
                _ => Injected::Proceed,
            },
            TestScenario::OomPersistent => match matched {
                Some(_) => Injected::Oom,
                None => Injected::Proceed,
            },
            TestScenario::ParseError => match matched {
                Some(file) => Injected::Error {
                    kind: FailureKind::ParseError,
                    message: format!("Parsing error: Unexpected token in {}", file.display()),
                    file: Some(file.clone()),
                },
                None => Injected::Proceed,
            },
            TestScenario::RuleCrash => match matched {
                Some(file) => Injected::Error {
                    kind: FailureKind::RuleCrash,
                    message: format!("Rule \"no-undef\" errored while visiting {}", file.display()),
                    file: None,
                },
                None => Injected::Proceed,
            },
            TestScenario::RandomOom => {
                if matched.is_some() && coin_flip() {
                    Injected::Oom
                } else {
                    Injected::Proceed
                }
            }
            TestScenario::SlowWorker => match matched {
                Some(_) => Injected::Delay(SLOW_WORKER_DELAY),
                None => Injected::Proceed,
            },
            TestScenario::All => self.evaluate_tagged(files),
        }
    }

    /// `all` mode: each file opts into a behavior by name tag.
    fn evaluate_tagged(&self, files: &[PathBuf]) -> Injected {
        let has_tag = |tag: &str| {
            files
                .iter()
                .find(|f| f.to_string_lossy().contains(tag))
                .cloned()
        };
        if has_tag("oom").is_some() {
            Injected::Oom
        } else if let Some(file) = has_tag("parse") {
            Injected::Error {
                kind: FailureKind::ParseError,
                message: format!("Parsing error: Unexpected token in {}", file.display()),
                file: Some(file),
            }
        } else if has_tag("crash").is_some() {
            Injected::Error {
                kind: FailureKind::RuleCrash,
                message: "Rule \"no-undef\" errored".to_string(),
                file: None,
            }
        } else if has_tag("slow").is_some() {
            Injected::Delay(SLOW_WORKER_DELAY)
        } else {
            Injected::Proceed
        }
    }

    /// Append one byte to the shared counter file and return the new
    /// count. On any I/O trouble the count reads as exhausted, so a
    /// broken counter can never wedge a run in a kill loop.
    fn bump_counter(&self) -> u64 {
        use std::io::Write;
        let path = self.state_dir.join("oom-injections");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                f.write_all(b"x")?;
                f.metadata().map(|m| m.len())
            });
        match result {
            Ok(len) => len,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "injection counter unavailable");
                u64::MAX
            }
        }
    }
}

/// One-in-three chance, seeded from RandomState plus the clock.
fn coin_flip() -> bool {
    let state = std::collections::hash_map::RandomState::new();
    let mut hasher = state.build_hasher();
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    hasher.write_u128(now.as_nanos());
    hasher.write_u64(u64::from(std::process::id()));
    hasher.finish() % 3 == 0
}

/// Execute one batch and exit. Called from the hidden `worker` mode of
/// the binary; the master is on the other end of fd 3.
pub async fn run_worker() -> CoreResult<()> {
    let settings = WorkerSettings::from_env();
    let framed = ipc::worker_stream()?;
    let (sink, mut stream) = framed.split();

    let Some(task) = ipc::next_frame::<MasterMessage>(&mut stream).await? else {
        return Err(CoreError::Protocol(
            "channel closed before a task arrived".into(),
        ));
    };
    let MasterMessage::Lint {
        worker_id,
        config_path,
        files,
        ..
    } = task;
    info!(worker = %worker_id, files = files.len(), "task received");

    // Everything outbound funnels through one writer task, so memory
    // samples and the terminal message can never interleave mid-frame.
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(write_outbound(sink, out_rx));

    match settings.injection.evaluate(&files) {
        Injected::Proceed => {}
        Injected::Delay(delay) => tokio::time::sleep(delay).await,
        Injected::Oom => {
            // Mirror a kernel OOM kill: no farewell message, just the
            // exit status the master knows how to read.
            std::process::exit(classify::OOM_EXIT_CODE);
        }
        Injected::Error {
            kind,
            message,
            file,
        } => {
            let _ = out_tx.send(WorkerMessage::Error {
                worker_id,
                error_type: kind,
                message,
                file,
            });
            drop(out_tx);
            let _ = writer.await;
            return Ok(());
        }
    }

    let mut sampler = MemorySampler::new();
    let (sample_tx, mut sample_rx) = mpsc::unbounded_channel();
    sampler.start(settings.sample_interval, Some(sample_tx));
    let forward = tokio::spawn({
        let out_tx = out_tx.clone();
        async move {
            while let Some(sample) = sample_rx.recv().await {
                let msg = WorkerMessage::Memory {
                    worker_id,
                    rss: sample.rss_bytes,
                    heap_used: sample.heap_used_bytes,
                    timestamp: sample.timestamp_ms,
                };
                if out_tx.send(msg).is_err() {
                    break;
                }
            }
        }
    });

    // The analyzer runs in its own task so a panic surfaces as a join
    // error and still produces a terminal `error` message.
    let analyzer = CommandAnalyzer::new(&settings.analyzer_program);
    let started = Instant::now();
    let lint = tokio::spawn(async move { analyzer.lint(&config_path, &files).await });
    let outcome = lint.await;

    sampler.stop();
    let _ = forward.await;

    let peak_rss = sampler.peak().max(memory::peak_rss_bytes());
    let duration_ms = started.elapsed().as_millis() as u64;

    let terminal = match outcome {
        Ok(Ok(results)) => {
            info!(worker = %worker_id, results = results.len(), duration_ms, "lint complete");
            WorkerMessage::Result {
                worker_id,
                results,
                peak_rss,
                duration_ms,
            }
        }
        Ok(Err(err)) => {
            let (message, file) = match err {
                AnalyzerError::Analysis { message, file } => (message, file),
                other => (other.to_string(), None),
            };
            let error_type = classify::classify_message(&message);
            warn!(worker = %worker_id, %error_type, message, "analyzer failed");
            WorkerMessage::Error {
                worker_id,
                error_type,
                message,
                file,
            }
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                format!("worker panicked: {join_err}")
            } else {
                format!("lint task aborted: {join_err}")
            };
            warn!(worker = %worker_id, message, "fatal worker condition");
            WorkerMessage::Error {
                worker_id,
                error_type: FailureKind::Unknown,
                message,
                file: None,
            }
        }
    };

    let _ = out_tx.send(terminal);
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn write_outbound(mut sink: IpcSink, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = ipc::send_frame(&mut sink, &msg).await {
            warn!(error = %e, "failed to send message to master");
            break;
        }
    }
}
