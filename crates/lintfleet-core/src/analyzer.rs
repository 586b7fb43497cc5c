//! The boundary to the external lint engine.
//!
//! The analyzer is a black box: it takes a config file path plus a list of
//! input paths and prints one JSON record per file. Records stay opaque
//! here; only the two aggregate counters are ever read out of them, and
//! that happens in the types layer.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use lintfleet_types::FileReport;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("failed to launch analyzer: {0}")]
    Launch(std::io::Error),
    /// The analyzer reported a failure; `message` carries its stderr text
    /// for downstream classification.
    #[error("{message}")]
    Analysis {
        message: String,
        file: Option<PathBuf>,
    },
    #[error("analyzer produced unreadable output: {0}")]
    Output(serde_json::Error),
}

/// Anything that can lint a list of files against a config.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn lint(
        &self,
        config: &Path,
        files: &[PathBuf],
    ) -> Result<Vec<FileReport>, AnalyzerError>;
}

/// Runs the analyzer as an external command.
///
/// Invocation shape: `<program> --config <path> --format json <files…>`.
/// Exit code 0 means clean, 1 means findings were reported; both produce a
/// JSON array on stdout. Anything above 1 is an analyzer failure and the
/// stderr text is surfaced for classification.
pub struct CommandAnalyzer {
    program: PathBuf,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn lint(
        &self,
        config: &Path,
        files: &[PathBuf],
    ) -> Result<Vec<FileReport>, AnalyzerError> {
        let output = Command::new(&self.program)
            .arg("--config")
            .arg(config)
            .arg("--format")
            .arg("json")
            .args(files)
            .output()
            .await
            .map_err(AnalyzerError::Launch)?;

        match output.status.code() {
            Some(0) | Some(1) => {
                let records: Vec<serde_json::Value> =
                    serde_json::from_slice(&output.stdout).map_err(AnalyzerError::Output)?;
                Ok(records.into_iter().map(FileReport::from_record).collect())
            }
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = match stderr.trim() {
                    "" => format!("analyzer exited with status {code:?}"),
                    text => text.to_string(),
                };
                Err(AnalyzerError::Analysis {
                    message,
                    file: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lintfleet-analyzer-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn clean_run_parses_records() {
        let dir = script_dir();
        let script = write_script(
            &dir,
            "ok-analyzer",
            "#!/bin/sh\necho '[{\"filePath\":\"a.ts\",\"errorCount\":0,\"warningCount\":2}]'\n",
        );
        let analyzer = CommandAnalyzer::new(&script);
        let reports = analyzer
            .lint(Path::new("/dev/null"), &[PathBuf::from("a.ts")])
            .await
            .unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].warning_count(), 2);
    }

    #[tokio::test]
    async fn findings_exit_code_still_parses() {
        let dir = script_dir();
        let script = write_script(
            &dir,
            "findings-analyzer",
            "#!/bin/sh\necho '[{\"filePath\":\"a.ts\",\"errorCount\":3,\"warningCount\":0}]'\nexit 1\n",
        );
        let analyzer = CommandAnalyzer::new(&script);
        let reports = analyzer
            .lint(Path::new("/dev/null"), &[PathBuf::from("a.ts")])
            .await
            .unwrap();
        assert_eq!(reports[0].error_count(), 3);
    }

    #[tokio::test]
    async fn fatal_exit_surfaces_stderr() {
        let dir = script_dir();
        let script = write_script(
            &dir,
            "fatal-analyzer",
            "#!/bin/sh\necho 'Parsing error: Unexpected token' >&2\nexit 2\n",
        );
        let analyzer = CommandAnalyzer::new(&script);
        let err = analyzer
            .lint(Path::new("/dev/null"), &[PathBuf::from("a.ts")])
            .await
            .unwrap_err();
        match err {
            AnalyzerError::Analysis { message, file } => {
                assert!(message.contains("Parsing error"));
                assert!(file.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let analyzer = CommandAnalyzer::new("/nonexistent/analyzer/binary");
        let err = analyzer.lint(Path::new("/dev/null"), &[]).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Launch(_)));
    }
}
