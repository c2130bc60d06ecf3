//! Jobs — lifecycle, registry, and state machine.
//!
//! Core components:
//! - `state` — Job state machine (NotStarted → Running → terminal)
//! - `job` — One scheduled unit of work: streams, signal, finalization
//! - `registry` — Process-wide id/name lookup and filtering

pub mod job;
pub mod registry;
pub mod state;

/// Process-unique integer job identifier.
pub type JobId = u64;

pub use job::{Job, JobOutcome, JobSnapshot};
pub use registry::JobRegistry;
pub use state::JobState;
