//! Error types for the orchestration kernel.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the orchestration kernel.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),
    #[error("ipc channel error: {0}")]
    Ipc(std::io::Error),
    #[error("ipc codec error: {0}")]
    Codec(serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("discovery error: {0}")]
    Discover(String),
    #[error("worker protocol violation: {0}")]
    Protocol(String),
}

impl CoreError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
