//! Throttle engine: admission decisions plus asynchronous counting
//!
//! [`ThrottleEngine`] is the gateway-facing surface. `check_and_consume`
//! answers from the in-memory window store without touching the network;
//! counting and event publishing happen afterwards on the dispatch workers,
//! so a slow or dead aggregator never delays a request.

use crate::config::{AgentConfig, EndpointConfig};
use crate::dispatch::{DispatchJob, DispatchPool, Dispatcher, ScopeParams};
use crate::error::Result;
use crate::event::AggregatorConnector;
use crate::group::EndpointGroup;
use parking_lot::Mutex;
use quotamesh::{QuotaError, ThrottleScope, TimeUnit, WindowStore};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// One scope's quota parameters as resolved from the request's policies
#[derive(Debug, Clone)]
pub struct ScopeQuota {
    pub key: String,
    pub limit: i64,
    pub unit_count: i64,
    /// Policy time unit string: min, hour, day, week, month or year
    pub time_unit: String,
    /// Reject on quota breach; `false` means count but admit
    pub stop_on_quota: bool,
}

/// All throttle parameters for one gateway request
#[derive(Debug, Clone)]
pub struct ThrottleRequest {
    pub resource: ScopeQuota,
    pub application: ScopeQuota,
    pub subscription: ScopeQuota,
    /// Epoch millis the gateway stamped the request with
    pub timestamp: i64,
}

/// Outcome of an admission check
///
/// The per-scope flags report window state regardless of `stop_on_quota`;
/// `throttled` is true only when a breached scope also demands rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub throttled: bool,
    pub resource_throttled: bool,
    pub application_throttled: bool,
    pub subscription_throttled: bool,
}

pub struct ThrottleEngine {
    store: Arc<WindowStore>,
    group: Arc<EndpointGroup>,
    dispatcher: Dispatcher,
    shutdown: AtomicBool,
    notify: Arc<Notify>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn window_millis(quota: &ScopeQuota) -> Result<i64> {
    if quota.key.is_empty() {
        return Err(QuotaError::InvalidParameter("empty throttle key".to_string()).into());
    }
    if quota.limit < 0 {
        return Err(QuotaError::InvalidParameter(format!(
            "negative limit for key {}",
            quota.key
        ))
        .into());
    }
    if quota.unit_count <= 0 {
        return Err(QuotaError::InvalidParameter(format!(
            "non-positive unit count for key {}",
            quota.key
        ))
        .into());
    }
    let unit = TimeUnit::from_str(&quota.time_unit)?;
    Ok(unit.to_millis(quota.unit_count))
}

impl ThrottleEngine {
    /// Build the store, connect the endpoint group, and start the dispatch
    /// workers and the sweeper
    ///
    /// # Panics
    ///
    /// Spawns background tasks immediately, so it must be called from
    /// within a tokio runtime.
    pub fn start(
        config: AgentConfig,
        endpoint_configs: Vec<EndpointConfig>,
        connector: Arc<dyn AggregatorConnector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let store = Arc::new(WindowStore::new());
        let group = EndpointGroup::start(&config, endpoint_configs, connector)?;
        let pool = Arc::new(DispatchPool::new(
            config.agent_pool_initial_size,
            config.agent_pool_max_size,
        ));
        let dispatcher = Dispatcher::start(
            pool,
            config.dispatch_workers,
            config.dispatch_queue_depth,
            Arc::clone(&store),
            Arc::clone(&group),
        );

        let engine = Arc::new(ThrottleEngine {
            store,
            group,
            dispatcher,
            shutdown: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
            sweeper: Mutex::new(None),
        });

        let sweeper = tokio::spawn(Arc::clone(&engine).run_sweeper(Duration::from_secs(
            config.sweep_interval_secs,
        )));
        *engine.sweeper.lock() = Some(sweeper);

        Ok(engine)
    }

    /// Decide admission for one request and, if admitted, count it
    ///
    /// The decision is made entirely from in-memory state. Counting and
    /// event publishing are handed to the dispatch pool afterwards, so a
    /// publishing failure can never turn into a rejected request.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::InvalidParameter`] or
    /// [`QuotaError::UnsupportedTimeUnit`] (wrapped in
    /// [`AgentError::Quota`](crate::AgentError::Quota)) for malformed quota
    /// parameters; nothing is counted in that case.
    pub async fn check_and_consume(&self, request: ThrottleRequest) -> Result<ThrottleDecision> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(crate::AgentError::Shutdown);
        }

        let resource_window = window_millis(&request.resource)?;
        let application_window = window_millis(&request.application)?;
        let subscription_window = window_millis(&request.subscription)?;

        let now = request.timestamp;
        let resource_throttled =
            self.store
                .is_throttled(&request.resource.key, ThrottleScope::Resource, now);
        let application_throttled =
            self.store
                .is_throttled(&request.application.key, ThrottleScope::Application, now);
        let subscription_throttled = self.store.is_throttled(
            &request.subscription.key,
            ThrottleScope::Subscription,
            now,
        );

        // The reject flag travels with the counted state: a breached scope
        // rejects according to the policy its counters were updated with
        let throttled = (resource_throttled
            && self
                .store
                .stop_on_quota(&request.resource.key, ThrottleScope::Resource))
            || (application_throttled
                && self
                    .store
                    .stop_on_quota(&request.application.key, ThrottleScope::Application))
            || (subscription_throttled
                && self
                    .store
                    .stop_on_quota(&request.subscription.key, ThrottleScope::Subscription));

        let decision = ThrottleDecision {
            throttled,
            resource_throttled,
            application_throttled,
            subscription_throttled,
        };

        // Rejected requests consume no quota
        if throttled {
            return Ok(decision);
        }

        let mut job = self.dispatcher.pool().acquire().await;
        job.resource = scope_params(&request.resource, resource_window);
        job.application = scope_params(&request.application, application_window);
        job.subscription = scope_params(&request.subscription, subscription_window);
        job.timestamp = request.timestamp;
        self.dispatcher.submit(job).await?;

        Ok(decision)
    }

    /// Read-only view of the counter store
    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.store.sweep(now_millis());
        }
        tracing::debug!("window sweeper stopped");
    }

    /// Drain the dispatch workers, flush and disconnect the endpoint group,
    /// and stop the sweeper
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        // Queued counter updates complete before the group flushes
        self.dispatcher.shutdown().await;
        self.group.shutdown().await;
        tracing::info!("throttle engine shut down");
    }
}

fn scope_params(quota: &ScopeQuota, unit_time_millis: i64) -> ScopeParams {
    ScopeParams {
        key: quota.key.clone(),
        limit: quota.limit,
        unit_time_millis,
        stop_on_quota: quota.stop_on_quota,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;

    fn quota(key: &str, limit: i64, unit: &str) -> ScopeQuota {
        ScopeQuota {
            key: key.to_string(),
            limit,
            unit_count: 1,
            time_unit: unit.to_string(),
            stop_on_quota: true,
        }
    }

    #[test]
    fn test_window_millis_resolution() {
        assert_eq!(window_millis(&quota("k", 10, "min")).unwrap(), 60_000);
        assert_eq!(window_millis(&quota("k", 10, "HOUR")).unwrap(), 3_600_000);
    }

    #[test]
    fn test_rejects_unknown_time_unit() {
        let err = window_millis(&quota("k", 10, "fortnight")).unwrap_err();
        assert!(matches!(
            err,
            AgentError::Quota(QuotaError::UnsupportedTimeUnit(_))
        ));
    }

    #[test]
    fn test_rejects_negative_limit() {
        let err = window_millis(&quota("k", -1, "min")).unwrap_err();
        assert!(matches!(
            err,
            AgentError::Quota(QuotaError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_rejects_empty_key() {
        let err = window_millis(&quota("", 10, "min")).unwrap_err();
        assert!(matches!(
            err,
            AgentError::Quota(QuotaError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_rejects_zero_unit_count() {
        let mut bad = quota("k", 10, "min");
        bad.unit_count = 0;
        assert!(window_millis(&bad).is_err());
    }
}
