//! Process-wide job registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;

use crate::error::JobError;
use crate::job::JobId;
use crate::job::job::{Job, JobSnapshot};
use crate::job::state::JobState;

/// Shared mapping from job id to job.
///
/// Jobs are only removed by explicit caller request, never automatically.
/// Enumeration returns id-ascending snapshots so callers can iterate while
/// jobs complete concurrently.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<BTreeMap<JobId, Arc<Job>>>,
    next_id: AtomicU64,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next process-unique job id.
    pub fn next_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a job.
    pub async fn add(&self, job: Arc<Job>) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id()) {
            return Err(JobError::DuplicateId { id: job.id() });
        }
        jobs.insert(job.id(), job);
        Ok(())
    }

    /// Remove a job, returning it.
    pub async fn remove(&self, id: JobId) -> Result<Arc<Job>, JobError> {
        self.jobs
            .write()
            .await
            .remove(&id)
            .ok_or(JobError::NotFound { id })
    }

    /// Look up a job by id.
    pub async fn get(&self, id: JobId) -> Result<Arc<Job>, JobError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound { id })
    }

    /// Look up the lowest-id job with the given name.
    pub async fn get_by_name(&self, name: &str) -> Option<Arc<Job>> {
        self.jobs
            .read()
            .await
            .values()
            .find(|j| j.name() == Some(name))
            .cloned()
    }

    /// Id-ascending snapshot of all registered jobs.
    pub async fn snapshot(&self) -> Vec<Arc<Job>> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Jobs whose snapshot satisfies `pred`, id ascending.
    pub async fn filter<F>(&self, pred: F) -> Vec<Arc<Job>>
    where
        F: Fn(&JobSnapshot) -> bool,
    {
        let jobs = self.snapshot().await;
        let mut matched = Vec::new();
        for job in jobs {
            if pred(&job.snapshot().await) {
                matched.push(job);
            }
        }
        matched
    }

    /// Jobs currently in `state`, id ascending.
    pub async fn filter_by_state(&self, state: JobState) -> Vec<Arc<Job>> {
        self.filter(|snap| snap.state == state).await
    }

    /// Jobs carrying the given batch tag, id ascending.
    pub async fn filter_by_batch(&self, batch: &str) -> Vec<Arc<Job>> {
        self.filter(|snap| snap.batch.as_deref() == Some(batch)).await
    }

    /// Number of registered jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}
