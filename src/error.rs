//! Error types for runpool.

use std::time::Duration;

use crate::job::JobId;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Execution-context pool errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Pool initialization failed: {reason}")]
    InitFailed { reason: String },

    #[error("Pool exhausted: no context freed within {waited:?}")]
    Exhausted { waited: Duration },

    #[error("Pool is closed")]
    Closed,
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: JobId },

    #[error("Job {id} already registered")]
    DuplicateId { id: JobId },

    #[error("Job {id} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: JobId,
        state: String,
        target: String,
    },

    #[error("Job {id} has not been started")]
    NotStarted { id: JobId },

    #[error("Timed out after {waited:?} waiting for job {id}")]
    WaitTimeout { id: JobId, waited: Duration },
}

/// Captured-stream errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Channel {channel} is closed, record rejected")]
    ChannelClosed { channel: String },
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
