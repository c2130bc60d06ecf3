//! Bounded pool of execution contexts.
//!
//! One mutex guards the idle list, the lease counters, and the FIFO waiter
//! queue. A context handed out by `acquire` moves out of the pool and is
//! never handed out again until `release` brings it back. Released contexts
//! always land on the idle list; queued callers are woken with a permit and
//! claim a context under the mutex, so a caller that gives up while queued
//! cannot strand a context in transit. A background reaper recomputes
//! disposal eligibility on a schedule.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::pool::context::ExecutionContext;

/// Lifecycle state of the pool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Opened,
    Closed,
}

#[derive(Debug)]
struct PoolInner {
    state: PoolState,
    /// Contexts owned by the pool, ready to lease.
    idle: Vec<ExecutionContext>,
    /// Contexts in existence, leased or idle. Never exceeds the cap.
    created: usize,
    /// Contexts currently leased to jobs.
    leases: usize,
    /// Queued acquire requests, longest-waiting first. Each entry carries a
    /// token so a timed-out caller can withdraw its own slot.
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
    next_waiter: u64,
    last_activity: DateTime<Utc>,
}

/// Bounded collection of reusable execution contexts.
pub struct Pool {
    id: Uuid,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl Pool {
    /// Open a pool, eagerly constructing the first context. Remaining
    /// contexts are created lazily up to the concurrency cap.
    pub fn open(config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        if config.max_concurrency == 0 {
            return Err(PoolError::InitFailed {
                reason: "max_concurrency must be at least 1".to_string(),
            });
        }

        let first = ExecutionContext::open();
        let pool = Arc::new(Self {
            id: Uuid::new_v4(),
            config,
            inner: Mutex::new(PoolInner {
                state: PoolState::Opened,
                idle: vec![first],
                created: 1,
                leases: 0,
                waiters: VecDeque::new(),
                next_waiter: 0,
                last_activity: Utc::now(),
            }),
        });
        tracing::info!(pool = %pool.id, max = pool.config.max_concurrency, "Pool opened");
        Ok(pool)
    }

    /// Pool identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Concurrency cap.
    pub fn maximum(&self) -> usize {
        self.config.max_concurrency
    }

    /// Free slots: `maximum - leased`.
    pub async fn available(&self) -> usize {
        let inner = self.inner.lock().await;
        self.config.max_concurrency - inner.leases
    }

    /// Current pool state.
    pub async fn state(&self) -> PoolState {
        self.inner.lock().await.state
    }

    /// Acquire a context, queueing up to the configured timeout.
    pub async fn acquire(&self) -> Result<ExecutionContext, PoolError> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Acquire a context, queueing (FIFO) up to `timeout`.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ExecutionContext, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (token, rx) = {
                let mut inner = self.inner.lock().await;
                if inner.state != PoolState::Opened {
                    return Err(PoolError::Closed);
                }
                inner.last_activity = Utc::now();

                // Queued callers go first; barging past them would break
                // FIFO order.
                if inner.waiters.is_empty() {
                    if let Some(ctx) = Self::claim_idle_locked(&mut inner) {
                        return Ok(ctx);
                    }
                    if inner.created < self.config.max_concurrency {
                        inner.created += 1;
                        inner.leases += 1;
                        return Ok(ExecutionContext::open());
                    }
                }

                let token = inner.next_waiter;
                inner.next_waiter += 1;
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back((token, tx));
                (token, rx)
            };

            match tokio::time::timeout_at(deadline, rx).await {
                // Woken: a context is idle and the front slot was ours. A
                // fresh acquire may have claimed it once the queue drained
                // behind us; queue again for the remaining time if so.
                Ok(Ok(())) => {
                    let mut inner = self.inner.lock().await;
                    if inner.state != PoolState::Opened {
                        return Err(PoolError::Closed);
                    }
                    if let Some(ctx) = Self::claim_idle_locked(&mut inner) {
                        Self::wake_next_locked(&mut inner);
                        return Ok(ctx);
                    }
                }
                // Sender dropped: the pool was disposed while we queued.
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    let mut inner = self.inner.lock().await;
                    inner.waiters.retain(|(t, _)| *t != token);
                    // An abandoned waiter ahead of us may have consumed a
                    // wake permit without claiming the context; with the
                    // queue now empty the context is ours.
                    if inner.state == PoolState::Opened && inner.waiters.is_empty() {
                        if let Some(ctx) = Self::claim_idle_locked(&mut inner) {
                            return Ok(ctx);
                        }
                    }
                    return Err(PoolError::Exhausted { waited: timeout });
                }
            }
        }
    }

    /// Return a context to the pool.
    ///
    /// The context always lands on the idle list under the lock; the
    /// longest-waiting queued caller, if any, is woken to claim it. Broken
    /// contexts are discarded, with a fresh replacement constructed when
    /// callers are queued so the queue does not starve.
    pub async fn release(&self, ctx: ExecutionContext) {
        let mut inner = self.inner.lock().await;
        inner.last_activity = Utc::now();
        inner.leases = inner.leases.saturating_sub(1);

        let mut ctx = ctx;
        if inner.state != PoolState::Opened {
            inner.created = inner.created.saturating_sub(1);
            ctx.close();
            return;
        }

        if !ctx.state().is_usable() {
            tracing::warn!(pool = %self.id, context = %ctx.id(), state = %ctx.state(),
                "Discarding unusable context");
            inner.created -= 1;
            if inner.waiters.is_empty() {
                return;
            }
            // Replace the discarded context so queued callers do not starve.
            inner.created += 1;
            ctx = ExecutionContext::open();
        }

        ctx.touch();
        inner.idle.push(ctx);
        Self::wake_next_locked(&mut inner);
    }

    fn claim_idle_locked(inner: &mut PoolInner) -> Option<ExecutionContext> {
        let mut ctx = inner.idle.pop()?;
        inner.leases += 1;
        ctx.touch();
        Some(ctx)
    }

    /// Wake the longest-waiting caller still listening, provided a context
    /// is idle for it to claim.
    fn wake_next_locked(inner: &mut PoolInner) {
        while !inner.idle.is_empty() {
            let Some((_, tx)) = inner.waiters.pop_front() else { return };
            if tx.send(()).is_ok() {
                return;
            }
            // Waiter gave up; try the next.
        }
    }

    /// Dispose the pool if it is fully idle past the idle threshold.
    ///
    /// Eligibility is a pure function of the lease count and idle age,
    /// recomputed on each call. Returns true when this call performed the
    /// disposal.
    pub async fn try_dispose(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != PoolState::Opened {
            return false;
        }
        let idle_age = Utc::now()
            .signed_duration_since(inner.last_activity)
            .to_std()
            .unwrap_or_default();
        if inner.leases != 0 || idle_age < self.config.idle_threshold {
            return false;
        }
        Self::dispose_locked(&mut inner);
        tracing::info!(pool = %self.id, "Disposed idle pool");
        true
    }

    /// Dispose the pool unconditionally. Queued acquires fail with
    /// [`PoolError::Closed`].
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != PoolState::Opened {
            return;
        }
        Self::dispose_locked(&mut inner);
        tracing::info!(pool = %self.id, "Pool closed");
    }

    fn dispose_locked(inner: &mut PoolInner) {
        for mut ctx in inner.idle.drain(..) {
            ctx.close();
        }
        // Dropping the senders fails queued acquires with Closed.
        inner.waiters.clear();
        inner.created = inner.leases;
        inner.state = PoolState::Closed;
    }

    /// Spawn the periodic disposal task. The task exits once the pool is
    /// disposed or dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.reaper_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.try_dispose().await {
                    break;
                }
                tracing::debug!(pool = %pool.id, "Pool not yet disposable");
            }
        })
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("max_concurrency", &self.config.max_concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max: usize) -> Arc<Pool> {
        Pool::open(PoolConfig {
            max_concurrency: max,
            acquire_timeout: Duration::from_millis(100),
            idle_threshold: Duration::from_millis(50),
            reaper_interval: Duration::from_millis(20),
        })
        .unwrap()
    }

    #[test]
    fn open_rejects_zero_concurrency() {
        let err = Pool::open(PoolConfig {
            max_concurrency: 0,
            ..PoolConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, PoolError::InitFailed { .. }));
    }

    #[tokio::test]
    async fn acquire_is_a_counting_semaphore() {
        let pool = small_pool(2);
        assert_eq!(pool.available().await, 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.available().await, 0);

        let err = pool.acquire_timeout(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));

        pool.release(a).await;
        assert_eq!(pool.available().await, 1);
        pool.release(b).await;
        assert_eq!(pool.available().await, 2);
    }

    #[tokio::test]
    async fn distinct_contexts_are_handed_out() {
        let pool = small_pool(2);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        pool.release(a).await;
        pool.release(b).await;
    }

    #[tokio::test]
    async fn released_context_is_reused() {
        let pool = small_pool(1);
        let a = pool.acquire().await.unwrap();
        let id = a.id();
        pool.release(a).await;

        let again = pool.acquire().await.unwrap();
        assert_eq!(again.id(), id);
        pool.release(again).await;
    }

    #[tokio::test]
    async fn waiters_wake_in_fifo_order() {
        let pool = small_pool(1);
        let held = pool.acquire().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        let p1 = pool.clone();
        let t1 = order_tx.clone();
        let first = tokio::spawn(async move {
            let ctx = p1.acquire_timeout(Duration::from_secs(2)).await.unwrap();
            t1.send("first").unwrap();
            p1.release(ctx).await;
        });

        // Ensure the first waiter is queued before the second.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let p2 = pool.clone();
        let t2 = order_tx;
        let second = tokio::spawn(async move {
            let ctx = p2.acquire_timeout(Duration::from_secs(2)).await.unwrap();
            t2.send("second").unwrap();
            p2.release(ctx).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held).await;

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(order_rx.recv().await, Some("first"));
        assert_eq!(order_rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_capacity() {
        let pool = small_pool(1);
        let held = pool.acquire().await.unwrap();

        {
            let waiter = pool.acquire_timeout(Duration::from_secs(2));
            tokio::pin!(waiter);
            // One poll queues the request.
            assert!(futures::poll!(waiter.as_mut()).is_pending());
            pool.release(held).await;
        } // waiter dropped without ever observing the release

        assert_eq!(pool.available().await, 1);
        let ctx = pool
            .acquire_timeout(Duration::from_millis(100))
            .await
            .unwrap();
        pool.release(ctx).await;
        assert_eq!(pool.available().await, 1);
    }

    #[tokio::test]
    async fn queued_caller_recovers_after_an_abandoned_waiter() {
        let pool = small_pool(1);
        let held = pool.acquire().await.unwrap();

        let second = {
            let front = pool.acquire_timeout(Duration::from_secs(2));
            tokio::pin!(front);
            assert!(futures::poll!(front.as_mut()).is_pending());

            let p = pool.clone();
            let second = tokio::spawn(async move {
                p.acquire_timeout(Duration::from_millis(300)).await
            });
            tokio::time::sleep(Duration::from_millis(50)).await;

            // The release wakes the front waiter, which then never acts.
            pool.release(held).await;
            second
        }; // front dropped with its wake permit unclaimed

        let ctx = second.await.unwrap().unwrap();
        pool.release(ctx).await;
        assert_eq!(pool.available().await, 1);
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_the_queue() {
        let pool = small_pool(1);
        let held = pool.acquire().await.unwrap();

        let err = pool
            .acquire_timeout(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { .. }));

        pool.release(held).await;
        // The stale queue slot must not swallow the released context.
        let ctx = pool
            .acquire_timeout(Duration::from_millis(100))
            .await
            .unwrap();
        pool.release(ctx).await;
        assert_eq!(pool.available().await, 1);
    }

    #[tokio::test]
    async fn broken_context_is_discarded() {
        let pool = small_pool(1);
        let mut ctx = pool.acquire().await.unwrap();
        let broken_id = ctx.id();
        ctx.mark_broken();
        pool.release(ctx).await;

        // Capacity is restored with a fresh context.
        assert_eq!(pool.available().await, 1);
        let replacement = pool.acquire().await.unwrap();
        assert_ne!(replacement.id(), broken_id);
        pool.release(replacement).await;
    }

    #[tokio::test]
    async fn broken_context_replacement_reaches_waiter() {
        let pool = small_pool(1);
        let mut held = pool.acquire().await.unwrap();

        let p = pool.clone();
        let waiter = tokio::spawn(async move {
            p.acquire_timeout(Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        held.mark_broken();
        pool.release(held).await;

        let ctx = waiter.await.unwrap().unwrap();
        assert!(ctx.state().is_usable());
        pool.release(ctx).await;
    }

    #[tokio::test]
    async fn try_dispose_requires_full_idle_and_age() {
        let pool = small_pool(2);

        let held = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        // A lease blocks disposal regardless of age.
        assert!(!pool.try_dispose().await);

        pool.release(held).await;
        // Fresh activity blocks disposal.
        assert!(!pool.try_dispose().await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(pool.try_dispose().await);
        assert_eq!(pool.state().await, PoolState::Closed);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Closed));
    }

    #[tokio::test]
    async fn close_fails_queued_waiters() {
        let pool = small_pool(1);
        let held = pool.acquire().await.unwrap();

        let p = pool.clone();
        let waiter = tokio::spawn(async move {
            p.acquire_timeout(Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.close().await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, PoolError::Closed));

        pool.release(held).await;
    }

    #[tokio::test]
    async fn reaper_disposes_idle_pool() {
        let pool = small_pool(2);
        let reaper = pool.spawn_reaper();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.state().await, PoolState::Closed);
        reaper.await.unwrap();
    }
}
