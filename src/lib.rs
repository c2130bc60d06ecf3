//! runpool — pooled background-job execution.
//!
//! Scripted units of work run concurrently against a bounded pool of
//! reusable execution contexts. Each job tracks its lifecycle and captures
//! five output streams; callers poll or block on a per-job completion
//! signal. Script interpretation is pluggable through the
//! [`interpreter::Interpreter`] capability.

pub mod config;
pub mod engine;
pub mod error;
pub mod interpreter;
pub mod job;
pub mod pool;
pub mod stream;
