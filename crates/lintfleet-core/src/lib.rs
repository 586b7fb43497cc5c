//! lintfleet-core: the orchestration kernel.
//!
//! This crate provides:
//!
//! - **Memory**: RSS/heap sampling of the current process
//! - **Ipc**: length-delimited JSON framing over the worker channel
//! - **Admission**: the RSS-gated spawn controller
//! - **Scheduler**: the single-threaded event reactor driving worker processes
//! - **Classify**: exit/message classification and the bisect-and-retry policy
//! - **Worker**: the child-side driver executing one batch
//! - **Analyzer**: the boundary to the external lint engine
//! - **Config**: run settings plus legacy config conversion
//! - **Discover**: glob-based file discovery
//! - **Persist**: JSON artifact writers and the final summary

pub mod admission;
pub mod analyzer;
pub mod classify;
pub mod config;
pub mod discover;
pub mod error;
pub mod ipc;
pub mod memory;
pub mod persist;
pub mod scheduler;
pub mod worker;

pub use admission::AdmissionController;
pub use analyzer::{Analyzer, AnalyzerError, CommandAnalyzer};
pub use config::{RunConfig, TestScenario};
pub use error::{CoreError, CoreResult};
pub use scheduler::Orchestrator;
