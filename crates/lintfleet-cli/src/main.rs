//! lintfleet CLI entry point.
//!
//! Usage:
//!   lintfleet --target=<path> [OPTIONS]   # orchestrate a lint run
//!   lintfleet worker                       # internal: worker mode
//!
//! The orchestrator spawns this same binary in `worker` mode for each
//! batch, with the IPC channel installed at fd 3.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lintfleet_core::{Orchestrator, RunConfig, TestScenario};

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var). Logs go to stderr
    // so worker lines interleave with the master's and stdout stays
    // reserved for the final report.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args: Vec<String> = env::args().collect();

    if args.get(1).map(String::as_str) == Some("worker") {
        return run_worker_mode();
    }

    let mut target: Option<PathBuf> = None;
    let mut glob: Option<String> = None;
    let mut scenario: Option<TestScenario> = None;
    let mut test_file: Option<String> = None;

    for arg in &args[1..] {
        if let Some(v) = arg.strip_prefix("--target=") {
            target = Some(PathBuf::from(v));
        } else if let Some(v) = arg.strip_prefix("--glob=") {
            glob = Some(v.to_string());
        } else if let Some(v) = arg.strip_prefix("--test=") {
            let parsed = TestScenario::parse(v)
                .with_context(|| format!("unknown test scenario: {v}"))?;
            scenario = Some(parsed);
        } else if let Some(v) = arg.strip_prefix("--test-file=") {
            test_file = Some(v.to_string());
        } else if arg == "--help" || arg == "-h" {
            print_help();
            return Ok(ExitCode::SUCCESS);
        } else {
            eprintln!("Unknown option: {arg}");
            eprintln!("Run 'lintfleet --help' for usage.");
            return Ok(ExitCode::FAILURE);
        }
    }

    let Some(target) = target else {
        eprintln!("lintfleet: --target is required");
        return Ok(ExitCode::FAILURE);
    };
    if !target.is_dir() {
        eprintln!("lintfleet: target is not a directory: {}", target.display());
        return Ok(ExitCode::FAILURE);
    }

    let mut config = RunConfig::new(&target);
    if let Some(glob) = glob {
        config.glob = glob;
    }
    if let Some(scenario) = scenario {
        config.scenario = scenario;
    }
    if let Some(test_file) = test_file {
        config.test_file = test_file;
    }
    config.apply_env();

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let orchestrator = Orchestrator::new(config)?;
        orchestrator.run().await
    })?;

    if summary.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Worker mode: execute one batch handed over fd 3, then exit.
fn run_worker_mode() -> Result<ExitCode> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(lintfleet_core::worker::run_worker())
        .context("worker failed")?;
    Ok(ExitCode::SUCCESS)
}

fn print_help() {
    println!(
        r#"lintfleet v{}, memory-aware batch linting

Usage:
  lintfleet --target=<path> [OPTIONS]

Options:
  --target=<path>       Root directory to analyze (required). The analyzer
                        config is resolved relative to this path.
  --glob=<pattern>      File-selection pattern relative to the target
                        (default: src/**/*.ts)
  --test=<scenario>     Failure injection: none, oom-single, oom-persistent,
                        parse-error, rule-crash, random-oom, slow-worker, all
                        (default: none)
  --test-file=<pat>     Substring selecting which files trigger the scenario
  -h, --help            Show this help

Environment:
  TEST_SCENARIO, TEST_TARGET_FILE, TEST_OOM_RETRIES
                        Mirror the --test flags for containerized use
  LINTFLEET_ANALYZER    Analyzer executable (default: eslint)
  LINTFLEET_MAX_WORKERS, LINTFLEET_CONTAINER_LIMIT_MB,
  LINTFLEET_MEM_THRESHOLD_PERCENT
                        Admission controller knobs

Results land under <target>/lint-results/: summary.json, per-worker
results, and memory timelines. Exit status is 0 when every file was
analyzed, 1 otherwise."#,
        env!("CARGO_PKG_VERSION")
    );
}
