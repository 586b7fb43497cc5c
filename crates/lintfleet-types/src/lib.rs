//! Pure data types for lintfleet: batches, wire messages, samples, reports.
//!
//! This crate is a leaf dependency with no async runtime and no I/O. It
//! exists so that both sides of the master/worker boundary (and external
//! consumers of the persisted artifacts) can share the type system without
//! pulling in lintfleet-core's process plumbing.

pub mod batch;
pub mod protocol;
pub mod report;
pub mod sample;

// Flat re-exports for convenience
pub use batch::*;
pub use protocol::*;
pub use report::*;
pub use sample::*;
