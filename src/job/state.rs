//! Job state machine.

use serde::{Deserialize, Serialize};

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is registered but has not begun executing.
    NotStarted,
    /// Job is executing on a leased context.
    Running,
    /// A stop was requested; the invocation has not yet acknowledged.
    Stopping,
    /// Job stopped in response to a stop request.
    Stopped,
    /// Job ran to completion without unhandled errors.
    Completed,
    /// Job ran and left unhandled errors.
    Failed,
    /// The execution context was lost mid-run.
    Disconnected,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // From NotStarted (Failed covers a job that never won a context)
            (NotStarted, Running) | (NotStarted, Stopping) | (NotStarted, Failed) |
            // From Running
            (Running, Stopping) | (Running, Completed) |
            (Running, Failed) | (Running, Disconnected) |
            // From Stopping (a stop the script never honored still completes)
            (Stopping, Stopped) | (Stopping, Completed) | (Stopping, Failed) |
            // Reconnection path
            (Disconnected, Running)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Completed | Self::Failed | Self::Disconnected
        )
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}
