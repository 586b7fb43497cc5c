//! Run settings and analyzer-config preparation.
//!
//! `RunConfig` collects every knob the orchestrator honors, with defaults
//! matching production use and environment overrides for containerized
//! runs. Analyzer config resolution lives here too: a modern flat config
//! next to the target wins; a legacy rc file is converted once (a pure
//! text transformation) and written into the output directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_GLOB: &str = "src/**/*.ts";
pub const DEFAULT_MAX_WORKERS: usize = 2;
pub const DEFAULT_CONTAINER_LIMIT_MB: u64 = 4096;
pub const DEFAULT_MEM_THRESHOLD_PERCENT: u64 = 75;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_BATCH_DIVISOR: usize = 4;
pub const DEFAULT_ANALYZER: &str = "eslint";
pub const OUTPUT_DIR_NAME: &str = "lint-results";

/// Modern flat config file name, resolved relative to the target.
pub const MODERN_CONFIG: &str = "lint.config.mjs";
/// Legacy rc file name, converted on the fly when no modern config exists.
pub const LEGACY_CONFIG: &str = ".lintrc.json";

/// Sentinel used by `--test-file` when no pattern is given, so scenarios
/// never trigger by accident on real file names.
pub const DEFAULT_TEST_FILE: &str = "__lintfleet_test__";

/// Failure-injection scenario executed inside workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestScenario {
    #[default]
    None,
    OomSingle,
    OomPersistent,
    ParseError,
    RuleCrash,
    RandomOom,
    SlowWorker,
    All,
}

impl TestScenario {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "oom-single" => Some(Self::OomSingle),
            "oom-persistent" => Some(Self::OomPersistent),
            "parse-error" => Some(Self::ParseError),
            "rule-crash" => Some(Self::RuleCrash),
            "random-oom" => Some(Self::RandomOom),
            "slow-worker" => Some(Self::SlowWorker),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::OomSingle => "oom-single",
            Self::OomPersistent => "oom-persistent",
            Self::ParseError => "parse-error",
            Self::RuleCrash => "rule-crash",
            Self::RandomOom => "random-oom",
            Self::SlowWorker => "slow-worker",
            Self::All => "all",
        };
        write!(f, "{s}")
    }
}

/// Everything the orchestrator needs for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root directory to analyze.
    pub target: PathBuf,
    /// File-selection pattern relative to `target`.
    pub glob: String,
    /// The external analyzer executable.
    pub analyzer_program: PathBuf,
    /// Where summary, timelines, and per-worker results land.
    pub output_dir: PathBuf,
    /// Executable spawned in worker mode. Defaults to the current binary.
    pub worker_program: Option<PathBuf>,
    pub max_workers: usize,
    pub container_limit_mb: u64,
    pub mem_threshold_percent: u64,
    pub max_retries: u32,
    pub initial_divisor: usize,
    pub master_sample_interval: Duration,
    pub worker_sample_interval: Duration,
    pub scenario: TestScenario,
    pub test_file: String,
    /// How many times `oom-single` re-kills before letting the batch pass.
    pub oom_retries: u32,
}

impl RunConfig {
    /// Defaults for a target directory, with output under the target.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let output_dir = target.join(OUTPUT_DIR_NAME);
        Self {
            target,
            glob: DEFAULT_GLOB.to_string(),
            analyzer_program: PathBuf::from(DEFAULT_ANALYZER),
            output_dir,
            worker_program: None,
            max_workers: DEFAULT_MAX_WORKERS,
            container_limit_mb: DEFAULT_CONTAINER_LIMIT_MB,
            mem_threshold_percent: DEFAULT_MEM_THRESHOLD_PERCENT,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_divisor: DEFAULT_BATCH_DIVISOR,
            master_sample_interval: Duration::from_millis(500),
            worker_sample_interval: Duration::from_millis(200),
            scenario: TestScenario::None,
            test_file: DEFAULT_TEST_FILE.to_string(),
            oom_retries: 1,
        }
    }

    /// Apply environment overrides (the containerized-use mirrors of the
    /// CLI flags, plus the admission knobs).
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("TEST_SCENARIO") {
            if let Some(s) = TestScenario::parse(&v) {
                self.scenario = s;
            }
        }
        if let Ok(v) = std::env::var("TEST_TARGET_FILE") {
            if !v.is_empty() {
                self.test_file = v;
            }
        }
        if let Ok(v) = std::env::var("TEST_OOM_RETRIES") {
            if let Ok(n) = v.parse() {
                self.oom_retries = n;
            }
        }
        if let Ok(v) = std::env::var("LINTFLEET_ANALYZER") {
            if !v.is_empty() {
                self.analyzer_program = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("LINTFLEET_WORKER_EXE") {
            if !v.is_empty() {
                self.worker_program = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("LINTFLEET_MAX_WORKERS") {
            if let Ok(n) = v.parse::<usize>() {
                self.max_workers = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("LINTFLEET_CONTAINER_LIMIT_MB") {
            if let Ok(n) = v.parse() {
                self.container_limit_mb = n;
            }
        }
        if let Ok(v) = std::env::var("LINTFLEET_MEM_THRESHOLD_PERCENT") {
            if let Ok(n) = v.parse() {
                self.mem_threshold_percent = n;
            }
        }
        if let Ok(v) = std::env::var("LINTFLEET_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("LINTFLEET_BATCH_DIVISOR") {
            if let Ok(n) = v.parse::<usize>() {
                self.initial_divisor = n.max(1);
            }
        }
    }

    /// The admission gate in bytes:
    /// `container_limit_mb × 1024² × mem_threshold_percent / 100`.
    pub fn threshold_bytes(&self) -> u64 {
        self.container_limit_mb * 1024 * 1024 * self.mem_threshold_percent / 100
    }

    /// The executable to spawn in worker mode.
    pub fn resolve_worker_program(&self) -> CoreResult<PathBuf> {
        match &self.worker_program {
            Some(p) => Ok(p.clone()),
            None => std::env::current_exe()
                .map_err(|e| CoreError::Config(format!("cannot locate own executable: {e}"))),
        }
    }
}

/// Convert a legacy rc file to the modern flat config format.
///
/// This is a pure text transformation: the legacy JSON's `rules` and
/// `parserOptions` tables are carried into a single flat config entry.
pub fn convert_legacy_config(legacy: &str) -> CoreResult<String> {
    let parsed: serde_json::Value = serde_json::from_str(legacy)
        .map_err(|e| CoreError::Config(format!("legacy config is not valid JSON: {e}")))?;

    let rules = parsed.get("rules").cloned().unwrap_or_else(|| serde_json::json!({}));
    let parser_options = parsed.get("parserOptions").cloned();

    let mut entry = serde_json::Map::new();
    if let Some(opts) = parser_options {
        entry.insert(
            "languageOptions".to_string(),
            serde_json::json!({ "parserOptions": opts }),
        );
    }
    entry.insert("rules".to_string(), rules);

    let body = serde_json::to_string_pretty(&serde_json::Value::Object(entry))
        .map_err(|e| CoreError::Config(format!("cannot render flat config: {e}")))?;

    Ok(format!("export default [\n{body},\n];\n"))
}

/// Resolve the analyzer config for `target`.
///
/// A modern flat config in the target wins. Otherwise a legacy rc file is
/// converted and written once into `output_dir`; workers only ever read
/// the result. Neither existing is a startup error.
pub fn prepare_config(target: &Path, output_dir: &Path) -> CoreResult<PathBuf> {
    let modern = target.join(MODERN_CONFIG);
    if modern.is_file() {
        return Ok(modern);
    }

    let legacy = target.join(LEGACY_CONFIG);
    if legacy.is_file() {
        let raw = std::fs::read_to_string(&legacy).map_err(|e| CoreError::io(&legacy, e))?;
        let converted = convert_legacy_config(&raw)?;
        let out = output_dir.join(MODERN_CONFIG);
        std::fs::create_dir_all(output_dir).map_err(|e| CoreError::io(output_dir, e))?;
        std::fs::write(&out, converted).map_err(|e| CoreError::io(&out, e))?;
        tracing::info!(from = %legacy.display(), to = %out.display(), "converted legacy analyzer config");
        return Ok(out);
    }

    Err(CoreError::Config(format!(
        "no analyzer config found: expected {} or {} under {}",
        MODERN_CONFIG,
        LEGACY_CONFIG,
        target.display()
    )))
}
