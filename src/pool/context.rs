//! Reusable execution contexts.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// Context is ready to run scripts.
    Opened,
    /// Context has released its resources.
    Closed,
    /// Context failed mid-run and must not be reused.
    Broken,
}

impl ContextState {
    /// Whether the context can still be leased to a job.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Opened)
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Broken => "broken",
        };
        write!(f, "{s}")
    }
}

/// One reusable unit of isolated session state.
///
/// Owned exclusively by the pool while idle; moves out to exactly one job
/// while leased and moves back in on release. `vars` is the session state
/// the interpreter may read and mutate across the jobs that reuse this
/// context.
#[derive(Debug)]
pub struct ExecutionContext {
    id: Uuid,
    state: ContextState,
    last_activity: DateTime<Utc>,
    vars: HashMap<String, String>,
}

impl ExecutionContext {
    /// Construct a ready context.
    pub(crate) fn open() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ContextState::Opened,
            last_activity: Utc::now(),
            vars: HashMap::new(),
        }
    }

    /// Pool-scoped identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Read a session variable.
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Write a session variable.
    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Refresh the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Age since the context was last active.
    pub fn idle_age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.last_activity)
            .to_std()
            .unwrap_or_default()
    }

    /// Flag the context as unusable. The pool discards broken contexts on
    /// release instead of re-queueing them.
    pub fn mark_broken(&mut self) {
        self.state = ContextState::Broken;
    }

    /// Shut the context down.
    pub(crate) fn close(&mut self) {
        self.vars.clear();
        self.state = ContextState::Closed;
    }
}
