//! Engine — the caller-facing job surface.
//!
//! `submit` registers a job and spawns one runner task for it. The runner
//! leases a context from the pool (queueing when the pool is busy), drives
//! the interpreter, and finalizes the job exactly once: streams closed,
//! terminal state settled, completion signal set, context released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{PoolError, Result};
use crate::interpreter::{CancelToken, Interpreter, ScriptError};
use crate::job::{Job, JobId, JobOutcome, JobRegistry, JobSnapshot, JobState};
use crate::pool::Pool;
use crate::stream::{Channel, Record};

/// Background-job execution engine.
pub struct Engine {
    config: EngineConfig,
    pool: Arc<Pool>,
    registry: Arc<JobRegistry>,
    interpreter: Arc<dyn Interpreter>,
    /// Runner tasks, for cleanup on remove/shutdown.
    runners: RwLock<HashMap<JobId, JoinHandle<()>>>,
    reaper: JoinHandle<()>,
}

impl Engine {
    /// Open an engine: opens the context pool and starts its reaper.
    pub fn open(config: EngineConfig, interpreter: Arc<dyn Interpreter>) -> Result<Self> {
        let pool = Pool::open(config.pool.clone())?;
        let reaper = pool.spawn_reaper();
        Ok(Self {
            config,
            pool,
            registry: Arc::new(JobRegistry::new()),
            interpreter,
            runners: RwLock::new(HashMap::new()),
            reaper,
        })
    }

    /// The underlying context pool.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// The job registry.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Submit a script for background execution.
    ///
    /// The job is registered in `NotStarted` and scheduled immediately; a
    /// job that later fails is still a fully queryable job, never an error
    /// here.
    pub async fn submit(
        &self,
        script: impl Into<String>,
        name: Option<&str>,
        batch: Option<&str>,
    ) -> Result<JobId> {
        let id = self.registry.next_id();
        let job = Arc::new(Job::new(
            id,
            script,
            name.map(String::from),
            batch.map(String::from),
            self.config.strict_streams,
        ));
        self.registry.add(job.clone()).await?;
        job.mark_scheduled();

        let handle = tokio::spawn(run_job(
            job,
            self.pool.clone(),
            self.interpreter.clone(),
            self.config.clone(),
        ));
        self.runners.write().await.insert(id, handle);
        tracing::info!(job = id, "Submitted job");
        Ok(id)
    }

    /// Snapshot of a job by id.
    pub async fn get(&self, id: JobId) -> Result<JobSnapshot> {
        Ok(self.registry.get(id).await?.snapshot().await)
    }

    /// Snapshot of the lowest-id job with the given name.
    pub async fn get_by_name(&self, name: &str) -> Option<JobSnapshot> {
        match self.registry.get_by_name(name).await {
            Some(job) => Some(job.snapshot().await),
            None => None,
        }
    }

    /// Block until the job reaches a terminal state, or `timeout` elapses.
    pub async fn wait(&self, id: JobId, timeout: Option<Duration>) -> Result<JobState> {
        let job = self.registry.get(id).await?;
        Ok(job.wait(timeout).await?)
    }

    /// Request a best-effort stop of a job.
    pub async fn stop(&self, id: JobId) -> Result<()> {
        let job = self.registry.get(id).await?;
        job.request_stop().await;
        Ok(())
    }

    /// Request a stop of every non-terminal job.
    pub async fn stop_all(&self) {
        for job in self.registry.snapshot().await {
            if job.state().await.is_active() {
                job.request_stop().await;
            }
        }
    }

    /// Remove a job from the registry. A still-running job is stopped
    /// first and granted the stop grace period before removal.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        let job = self.registry.get(id).await?;
        if job.state().await.is_active() {
            job.request_stop().await;
            let grace = self.config.stop_grace + Duration::from_secs(1);
            let _ = job.wait(Some(grace)).await;
        }
        self.registry.remove(id).await?;

        if let Some(handle) = self.runners.write().await.remove(&id) {
            // A finalized job's runner may still be returning its context;
            // only an unresponsive, still-active runner gets aborted.
            if !handle.is_finished() && job.state().await.is_active() {
                tracing::warn!(job = id, "Aborting unresponsive runner on remove");
                handle.abort();
            }
        }
        tracing::info!(job = id, "Removed job");
        Ok(())
    }

    /// Full recorded sequence of one of a job's channels.
    pub async fn drain(&self, id: JobId, channel: Channel) -> Result<Vec<Record>> {
        let job = self.registry.get(id).await?;
        Ok(job.streams().drain(channel).await)
    }

    /// Snapshots of all jobs, id ascending.
    pub async fn list(&self) -> Vec<JobSnapshot> {
        let mut out = Vec::new();
        for job in self.registry.snapshot().await {
            out.push(job.snapshot().await);
        }
        out
    }

    /// Snapshots of jobs carrying the given batch tag.
    pub async fn filter_by_batch(&self, batch: &str) -> Vec<JobSnapshot> {
        let mut out = Vec::new();
        for job in self.registry.filter_by_batch(batch).await {
            out.push(job.snapshot().await);
        }
        out
    }

    /// Snapshots of jobs currently in `state`.
    pub async fn filter_by_state(&self, state: JobState) -> Vec<JobSnapshot> {
        let mut out = Vec::new();
        for job in self.registry.filter_by_state(state).await {
            out.push(job.snapshot().await);
        }
        out
    }

    /// Stop all jobs, wait out the grace period, and dispose the pool.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        let grace = self.config.stop_grace + Duration::from_secs(1);
        for job in self.registry.snapshot().await {
            if job.state().await.is_active() {
                let _ = job.wait(Some(grace)).await;
            }
        }

        self.reaper.abort();
        self.pool.close().await;

        let mut runners = self.runners.write().await;
        for (id, handle) in runners.drain() {
            if handle.is_finished() {
                continue;
            }
            let still_active = match self.registry.get(id).await {
                Ok(job) => job.state().await.is_active(),
                Err(_) => false,
            };
            if still_active {
                tracing::warn!(job = id, "Aborting runner on shutdown");
                handle.abort();
            }
        }
        tracing::info!("Engine shut down");
    }
}

/// Drive one job from submission to finalization.
async fn run_job(
    job: Arc<Job>,
    pool: Arc<Pool>,
    interpreter: Arc<dyn Interpreter>,
    config: EngineConfig,
) {
    let token = job.cancel_token();

    // Lease a context, racing any stop request arriving while queued.
    let acquired = tokio::select! {
        res = acquire_with_retry(&pool) => res,
        _ = token.cancelled() => {
            job.finalize(JobOutcome::Stopped).await;
            return;
        }
    };
    let mut ctx = match acquired {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!(job = job.id(), error = %e, "Job never won a context");
            let _ = job
                .streams()
                .append(Channel::Error, Record::text(e.to_string()))
                .await;
            job.finalize(JobOutcome::Failed).await;
            return;
        }
    };

    if job.mark_running().await.is_err() {
        // Stopped between acquire and start.
        job.finalize(JobOutcome::Stopped).await;
        pool.release(ctx).await;
        return;
    }
    tracing::info!(job = job.id(), context = %ctx.id(), "Job running");

    let sink = job.streams().sink();
    let mut forced = false;
    let result = {
        let mut invoke = interpreter.invoke(job.command(), &mut ctx, sink, token.clone());
        tokio::select! {
            res = &mut invoke => res,
            _ = overdue_stop(&token, config.stop_grace) => {
                forced = true;
                Err(ScriptError::Cancelled)
            }
        }
    };
    if forced {
        tracing::warn!(job = job.id(), "Stop grace elapsed, discarding context");
        ctx.mark_broken();
    }

    let outcome = match result {
        Ok(()) => JobOutcome::Completed,
        Err(ScriptError::Cancelled) => JobOutcome::Stopped,
        Err(ScriptError::Failed(reason)) => {
            let _ = job
                .streams()
                .append(Channel::Error, Record::text(reason))
                .await;
            JobOutcome::Failed
        }
        Err(ScriptError::ContextLost(reason)) => {
            let _ = job
                .streams()
                .append(Channel::Error, Record::text(reason))
                .await;
            ctx.mark_broken();
            JobOutcome::Disconnected
        }
    };

    job.finalize(outcome).await;
    pool.release(ctx).await;
}

/// One retry on exhaustion before the failure sticks to the job.
async fn acquire_with_retry(
    pool: &Arc<Pool>,
) -> std::result::Result<crate::pool::ExecutionContext, PoolError> {
    match pool.acquire().await {
        Err(PoolError::Exhausted { .. }) => {
            tracing::debug!("Pool exhausted, retrying acquisition once");
            pool.acquire().await
        }
        other => other,
    }
}

/// Resolves once a stop request has gone unacknowledged past the grace
/// period.
async fn overdue_stop(token: &CancelToken, grace: Duration) {
    token.cancelled().await;
    tokio::time::sleep(grace).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, JobError};
    use crate::interpreter::EchoInterpreter;

    fn echo_engine(max: usize) -> Engine {
        Engine::open(
            EngineConfig::with_max_concurrency(max),
            Arc::new(EchoInterpreter),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn submit_and_wait_round_trip() {
        let engine = echo_engine(2);
        let id = engine.submit("hello", Some("greeter"), None).await.unwrap();

        let state = engine.wait(id, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(state, JobState::Completed);

        let out = engine.drain(id, Channel::Output).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_str(), Some("hello"));

        let snap = engine.get_by_name("greeter").await.unwrap();
        assert_eq!(snap.id, id);
        assert!(snap.completed);
    }

    #[tokio::test]
    async fn wait_on_unknown_job_is_not_found() {
        let engine = echo_engine(1);
        let err = engine.wait(42, None).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { id: 42 })));
    }

    #[tokio::test]
    async fn remove_returns_context_bookkeeping_to_clean_state() {
        let engine = echo_engine(1);
        let id = engine.submit("bye", None, None).await.unwrap();
        engine.wait(id, Some(Duration::from_secs(2))).await.unwrap();

        engine.remove(id).await.unwrap();
        assert!(engine.registry().is_empty().await);

        // The runner releases the context just after signaling completion.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.pool().available().await, engine.pool().maximum());
    }

    #[tokio::test]
    async fn remove_nonexistent_job_surfaces_not_found() {
        let engine = echo_engine(1);
        let err = engine.remove(7).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { id: 7 })));
        assert!(engine.registry().is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_closes_the_pool() {
        let engine = echo_engine(2);
        let id = engine.submit("last", None, None).await.unwrap();
        engine.wait(id, Some(Duration::from_secs(2))).await.unwrap();

        engine.shutdown().await;
        assert_eq!(
            engine.pool().state().await,
            crate::pool::PoolState::Closed
        );
    }
}
