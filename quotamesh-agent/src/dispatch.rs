//! Dispatch agent pool and counter-update workers
//!
//! Counter updates happen off the request path: the request handler fills a
//! pooled [`DispatchJob`] and submits it to a bounded worker pool. Jobs are
//! reused to avoid per-request allocation and are cleared to their zero
//! value before going back to the pool, so no update's data leaks into the
//! next reuse.

use crate::error::{AgentError, Result};
use crate::event::ThrottleEvent;
use crate::group::EndpointGroup;
use parking_lot::Mutex;
use quotamesh::{ThrottleScope, WindowStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

const POOL_WAIT: Duration = Duration::from_millis(1);

/// Per-scope parameters carried by a dispatch job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeParams {
    pub key: String,
    pub limit: i64,
    pub unit_time_millis: i64,
    pub stop_on_quota: bool,
}

/// One throttle update's full parameter set
///
/// Mutable and pooled; [`DispatchJob::clear`] resets every field to its
/// zero value before the job is returned to the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchJob {
    pub resource: ScopeParams,
    pub application: ScopeParams,
    pub subscription: ScopeParams,
    pub timestamp: i64,
}

impl DispatchJob {
    pub fn clear(&mut self) {
        *self = DispatchJob::default();
    }

    pub fn is_cleared(&self) -> bool {
        *self == DispatchJob::default()
    }
}

/// Bounded pool of reusable dispatch jobs
///
/// `acquire` pops an idle job, grows the pool up to the configured ceiling,
/// or waits for a release once the ceiling is reached.
pub struct DispatchPool {
    idle: Mutex<Vec<DispatchJob>>,
    created: AtomicUsize,
    max_size: usize,
}

impl DispatchPool {
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        let idle = (0..initial_size).map(|_| DispatchJob::default()).collect();
        DispatchPool {
            idle: Mutex::new(idle),
            created: AtomicUsize::new(initial_size),
            max_size,
        }
    }

    pub async fn acquire(&self) -> DispatchJob {
        loop {
            if let Some(job) = self.idle.lock().pop() {
                return job;
            }
            // Grow until the ceiling, then wait for a release
            let created = self.created.load(Ordering::Acquire);
            if created < self.max_size
                && self
                    .created
                    .compare_exchange(created, created + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return DispatchJob::default();
            }
            tokio::time::sleep(POOL_WAIT).await;
        }
    }

    pub fn release(&self, mut job: DispatchJob) {
        job.clear();
        self.idle.lock().push(job);
    }

    #[cfg(test)]
    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Bounded worker pool applying dispatched updates
///
/// Workers update the window store and enqueue the consumption event into
/// the endpoint group. Submission blocks when the job queue is full;
/// nothing is dropped at this stage. Worker failures are logged and never
/// reach the request path.
pub struct Dispatcher {
    pool: Arc<DispatchPool>,
    job_tx: Mutex<Option<tokio::sync::mpsc::Sender<DispatchJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(
        pool: Arc<DispatchPool>,
        worker_count: usize,
        queue_depth: usize,
        store: Arc<WindowStore>,
        group: Arc<EndpointGroup>,
    ) -> Self {
        let (job_tx, job_rx) = tokio::sync::mpsc::channel::<DispatchJob>(queue_depth);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let workers = (0..worker_count)
            .map(|_| {
                let job_rx = Arc::clone(&job_rx);
                let pool = Arc::clone(&pool);
                let store = Arc::clone(&store);
                let group = Arc::clone(&group);
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = job_rx.lock().await;
                            rx.recv().await
                        };
                        match job {
                            Some(job) => {
                                let job = run_job(job, &store, &group).await;
                                // The job goes back to the pool on every
                                // exit path, success or not
                                pool.release(job);
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Dispatcher {
            pool,
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(workers),
        }
    }

    pub fn pool(&self) -> &Arc<DispatchPool> {
        &self.pool
    }

    /// Hand a job to the worker pool, blocking while the queue is full
    pub async fn submit(&self, job: DispatchJob) -> Result<()> {
        let tx = self.job_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(job).await.map_err(|_| AgentError::Shutdown),
            None => Err(AgentError::Shutdown),
        }
    }

    /// Stop accepting jobs and wait for the workers to drain
    ///
    /// Idempotent; queued jobs are completed, not discarded.
    pub async fn shutdown(&self) {
        let tx = self.job_tx.lock().take();
        drop(tx);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn run_job(job: DispatchJob, store: &WindowStore, group: &EndpointGroup) -> DispatchJob {
    // A cleared job reaching a worker is a caller bug; skip it rather than
    // poison the counters with empty keys
    if job.is_cleared() {
        tracing::error!("dispatch job submitted without being filled, skipping");
        return job;
    }
    for (scope, params) in [
        (ThrottleScope::Resource, &job.resource),
        (ThrottleScope::Application, &job.application),
        (ThrottleScope::Subscription, &job.subscription),
    ] {
        store.update(
            &params.key,
            scope,
            params.limit,
            params.unit_time_millis,
            params.stop_on_quota,
            job.timestamp,
        );
    }

    let event = ThrottleEvent {
        resource_key: job.resource.key.clone(),
        application_key: job.application.key.clone(),
        subscription_key: job.subscription.key.clone(),
        resource_count: scope_count(store, &job.resource.key, ThrottleScope::Resource),
        application_count: scope_count(store, &job.application.key, ThrottleScope::Application),
        subscription_count: scope_count(store, &job.subscription.key, ThrottleScope::Subscription),
        timestamp: job.timestamp,
    };

    // Best-effort: losing an event only costs distributed accuracy, and a
    // full queue must never stall the counter-update workers
    if let Err(e) = group.try_publish(event).await {
        tracing::warn!("consumption event not published: {e}");
    }

    job
}

fn scope_count(store: &WindowStore, key: &str, scope: ThrottleScope) -> i64 {
    store.snapshot(key, scope).map(|s| s.count).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleared_job_is_zeroed() {
        let mut job = DispatchJob {
            resource: ScopeParams {
                key: "res".to_string(),
                limit: 10,
                unit_time_millis: 60_000,
                stop_on_quota: true,
            },
            application: ScopeParams::default(),
            subscription: ScopeParams::default(),
            timestamp: 42,
        };
        job.clear();
        assert!(job.is_cleared());
        assert_eq!(job.timestamp, 0);
        assert!(job.resource.key.is_empty());
    }

    #[tokio::test]
    async fn test_release_clears_before_reuse() {
        let pool = DispatchPool::new(1, 1);
        let mut job = pool.acquire().await;
        job.timestamp = 99;
        job.resource.key = "res".to_string();
        pool.release(job);

        // The pool is at its ceiling, so this must be the same slot
        let reused = pool.acquire().await;
        assert!(reused.is_cleared());
    }

    #[tokio::test]
    async fn test_pool_grows_to_ceiling() {
        let pool = DispatchPool::new(1, 3);
        let a = pool.acquire().await;
        let b = pool.acquire().await;
        let c = pool.acquire().await;
        assert_eq!(pool.idle_len(), 0);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.idle_len(), 3);
    }

    #[tokio::test]
    async fn test_acquire_waits_at_ceiling() {
        let pool = Arc::new(DispatchPool::new(1, 1));
        let job = pool.acquire().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        // The waiter cannot finish until the job is released
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        pool.release(job);
        let reused = waiter.await.unwrap();
        assert!(reused.is_cleared());
    }
}
