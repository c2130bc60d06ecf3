//! One scheduled unit of work.
//!
//! A job owns its stream collector and completion signal outright and holds
//! the cancel channel its interpreter observes. State and timestamps live
//! behind one lock; finalization is guarded by a one-shot flag so a stop
//! request racing natural completion produces exactly one terminal
//! transition and exactly one signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use crate::error::JobError;
use crate::interpreter::CancelToken;
use crate::job::JobId;
use crate::job::state::JobState;
use crate::stream::StreamCollector;

/// How a job's invocation ended, as reported by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The invocation returned normally.
    Completed,
    /// The invocation failed or never won a context.
    Failed,
    /// The invocation acknowledged a stop request.
    Stopped,
    /// The execution context was lost.
    Disconnected,
}

#[derive(Debug)]
struct JobInner {
    state: JobState,
    stop_requested: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// A scheduled unit of work and its captured streams.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    instance_id: Uuid,
    name: Option<String>,
    batch: Option<String>,
    command: String,
    created_at: DateTime<Utc>,
    inner: Mutex<JobInner>,
    streams: StreamCollector,
    cancel_tx: watch::Sender<bool>,
    signal_tx: watch::Sender<bool>,
    /// One-shot guard: finalization runs exactly once.
    finalized: AtomicBool,
    /// Set once a runner has been spawned for this job.
    scheduled: AtomicBool,
}

impl Job {
    /// Create a job in `NotStarted`.
    pub fn new(
        id: JobId,
        command: impl Into<String>,
        name: Option<String>,
        batch: Option<String>,
        strict_streams: bool,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (signal_tx, _) = watch::channel(false);
        Self {
            id,
            instance_id: Uuid::new_v4(),
            name,
            batch,
            command: command.into(),
            created_at: Utc::now(),
            inner: Mutex::new(JobInner {
                state: JobState::NotStarted,
                stop_requested: false,
                started_at: None,
                finished_at: None,
            }),
            streams: StreamCollector::new(strict_streams),
            cancel_tx,
            signal_tx,
            finalized: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
        }
    }

    /// Process-unique integer id.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Process-unique instance identifier for cross-process correlation.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Optional human-readable name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Optional batch tag for group filtering.
    pub fn batch(&self) -> Option<&str> {
        self.batch.as_deref()
    }

    /// The original script text.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The job's captured streams.
    pub fn streams(&self) -> &StreamCollector {
        &self.streams
    }

    /// Token the interpreter observes for stop requests.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(self.cancel_tx.subscribe())
    }

    /// Current state.
    pub async fn state(&self) -> JobState {
        self.inner.lock().await.state
    }

    /// Whether the job reached a terminal state.
    pub async fn completed(&self) -> bool {
        self.state().await.is_terminal()
    }

    /// Whether the error channel holds any record.
    pub async fn has_errors(&self) -> bool {
        self.streams.has_errors().await
    }

    /// Whether any channel holds records not yet drained. Independent of
    /// terminal state.
    pub async fn has_more_data(&self) -> bool {
        self.streams.has_unread().await
    }

    pub(crate) fn mark_scheduled(&self) {
        self.scheduled.store(true, Ordering::SeqCst);
    }

    /// Transition to Running. Valid only from NotStarted with no pending
    /// stop request.
    pub(crate) async fn mark_running(&self) -> Result<(), JobError> {
        let mut inner = self.inner.lock().await;
        if inner.state != JobState::NotStarted || inner.stop_requested {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: inner.state.to_string(),
                target: JobState::Running.to_string(),
            });
        }
        inner.state = JobState::Running;
        inner.started_at = Some(Utc::now());
        Ok(())
    }

    /// Request cancellation. Valid from NotStarted or Running; a no-op on a
    /// job already stopping or terminal.
    pub async fn request_stop(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            JobState::NotStarted | JobState::Running => {
                inner.stop_requested = true;
                inner.state = JobState::Stopping;
                let _ = self.cancel_tx.send(true);
                tracing::info!(job = self.id, "Stop requested");
            }
            JobState::Stopping => {}
            _ => {
                tracing::debug!(job = self.id, state = %inner.state, "Stop ignored, job already terminal");
            }
        }
    }

    /// Finalize the job: close streams, settle the terminal state, and set
    /// the completion signal. Runs at most once; returns false when another
    /// caller finalized first.
    pub(crate) async fn finalize(&self, outcome: JobOutcome) -> bool {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.streams.close().await;
        let has_errors = self.streams.has_errors().await;

        let mut inner = self.inner.lock().await;
        let target = match outcome {
            JobOutcome::Completed if has_errors && !inner.stop_requested => JobState::Failed,
            JobOutcome::Completed => JobState::Completed,
            JobOutcome::Failed if inner.stop_requested => JobState::Stopped,
            JobOutcome::Failed => JobState::Failed,
            JobOutcome::Stopped => JobState::Stopped,
            JobOutcome::Disconnected => JobState::Disconnected,
        };
        if !inner.state.can_transition_to(target) {
            tracing::warn!(job = self.id, from = %inner.state, to = %target,
                "Unexpected finalization transition");
        }
        inner.state = target;
        inner.finished_at = Some(Utc::now());
        drop(inner);

        let _ = self.signal_tx.send(true);
        tracing::info!(job = self.id, state = %target, "Job finalized");
        true
    }

    /// Block on the completion signal up to `timeout`.
    ///
    /// Returns immediately when already terminal. Fails with
    /// [`JobError::NotStarted`] on a job that was never scheduled.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<JobState, JobError> {
        let mut rx = self.signal_tx.subscribe();
        {
            let inner = self.inner.lock().await;
            if inner.state.is_terminal() {
                return Ok(inner.state);
            }
            if inner.state == JobState::NotStarted && !self.scheduled.load(Ordering::SeqCst) {
                return Err(JobError::NotStarted { id: self.id });
            }
        }

        match timeout {
            Some(d) => {
                if tokio::time::timeout(d, rx.wait_for(|done| *done))
                    .await
                    .is_err()
                {
                    return Err(JobError::WaitTimeout {
                        id: self.id,
                        waited: d,
                    });
                }
            }
            None => {
                let _ = rx.wait_for(|done| *done).await;
            }
        }
        Ok(self.state().await)
    }

    /// Serializable point-in-time view of the job.
    pub async fn snapshot(&self) -> JobSnapshot {
        let inner = self.inner.lock().await;
        JobSnapshot {
            id: self.id,
            instance_id: self.instance_id,
            name: self.name.clone(),
            batch: self.batch.clone(),
            command: self.command.clone(),
            state: inner.state,
            completed: inner.state.is_terminal(),
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            created_at: self.created_at,
            has_errors: self.streams.has_errors().await,
            has_more_data: self.streams.has_unread().await,
        }
    }
}

/// Point-in-time view of a job, safe to hand to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub instance_id: Uuid,
    pub name: Option<String>,
    pub batch: Option<String>,
    pub command: String,
    pub state: JobState,
    pub completed: bool,
    pub has_errors: bool,
    pub has_more_data: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
