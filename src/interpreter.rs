//! The scripting-interpreter seam.
//!
//! The engine never interprets script text itself. It hands the script, a
//! leased [`ExecutionContext`], a [`StreamSink`] and a [`CancelToken`] to an
//! opaque [`Interpreter`] capability and waits for the outcome. Failures are
//! outcomes, not panics: they land in the job's error channel.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::pool::ExecutionContext;
use crate::stream::StreamSink;

/// Outcome of a failed or interrupted invocation.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The script raised an unhandled error.
    #[error("Script failed: {0}")]
    Failed(String),

    /// The script observed the cancel token and stopped early.
    #[error("Script cancelled")]
    Cancelled,

    /// The execution context became unusable mid-run.
    #[error("Execution context lost: {0}")]
    ContextLost(String),
}

impl From<crate::error::StreamError> for ScriptError {
    fn from(e: crate::error::StreamError) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Best-effort cancellation token observed by the interpreter.
///
/// Cloned freely; all clones observe the same one-shot cancel signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Sender gone without a cancel request; stay pending so select
            // arms racing against this future fall through to completion.
            std::future::pending::<()>().await;
        }
    }
}

/// Capability that executes one script inside a leased context.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Run `script` to completion, emitting records through `sink`.
    ///
    /// Implementations should poll or await `cancel` and return
    /// [`ScriptError::Cancelled`] when honoring a stop request. Returning
    /// [`ScriptError::ContextLost`] marks the context broken and the job
    /// disconnected.
    async fn invoke(
        &self,
        script: &str,
        ctx: &mut ExecutionContext,
        sink: StreamSink,
        cancel: CancelToken,
    ) -> Result<(), ScriptError>;
}

/// Trivial interpreter that echoes the script text as a single result
/// record. Useful as a placeholder and in smoke tests.
#[derive(Debug, Default)]
pub struct EchoInterpreter;

#[async_trait]
impl Interpreter for EchoInterpreter {
    async fn invoke(
        &self,
        script: &str,
        ctx: &mut ExecutionContext,
        sink: StreamSink,
        cancel: CancelToken,
    ) -> Result<(), ScriptError> {
        if cancel.is_cancelled() {
            return Err(ScriptError::Cancelled);
        }
        ctx.set_var("last_command", script);
        sink.verbose(format!("echo: {script}")).await?;
        sink.output_text(script).await?;
        Ok(())
    }
}
