//! Endpoint group: high-availability event publishing
//!
//! An [`EndpointGroup`] routes consumption events across one or more
//! aggregator connections under a failover or load-balance policy. With the
//! async strategy a bounded queue decouples producers from the single
//! consumer task; a reconnection supervisor revives dead connections in the
//! background.

use crate::config::{AgentConfig, EndpointConfig, HaMode, PublishingStrategy};
use crate::connection::ConnectionWorker;
use crate::endpoint::{Endpoint, EndpointState};
use crate::error::{AgentError, Result};
use crate::event::{AggregatorConnector, ThrottleEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// Pause between laps of the selection loop and full-queue retries.
/// Busy-waiting with a short sleep keeps the implementation simple at the
/// connection counts this agent runs with.
const BUSY_WAIT: Duration = Duration::from_millis(1);
const QUEUE_FULL_WAIT: Duration = Duration::from_millis(2);

pub struct EndpointGroup {
    endpoints: Vec<Arc<Endpoint>>,
    workers: Vec<Arc<ConnectionWorker>>,
    ha_mode: HaMode,
    queue_tx: Option<mpsc::Sender<ThrottleEvent>>,
    rr_index: AtomicUsize,
    reconnection_interval: Duration,
    shutdown: AtomicBool,
    notify: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EndpointGroup {
    /// Build the group, connect all endpoints, and start its background
    /// tasks (queue consumer for the async strategy, reconnection
    /// supervisor always)
    ///
    /// # Panics
    ///
    /// Spawns the connection attempts and background tasks immediately, so
    /// it must be called from within a tokio runtime.
    pub fn start(
        config: &AgentConfig,
        endpoint_configs: Vec<EndpointConfig>,
        connector: Arc<dyn AggregatorConnector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if endpoint_configs.is_empty() {
            return Err(AgentError::Configuration(
                "an endpoint group needs at least one receiver".to_string(),
            ));
        }
        for endpoint_config in &endpoint_configs {
            endpoint_config.parse_receiver_url()?;
        }

        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let endpoints: Vec<Arc<Endpoint>> = endpoint_configs
            .into_iter()
            .enumerate()
            .map(|(index, endpoint_config)| {
                Arc::new(Endpoint::new(
                    index,
                    endpoint_config,
                    config.batch_size,
                    config.max_pool_size,
                    failure_tx.clone(),
                ))
            })
            .collect();

        let workers: Vec<Arc<ConnectionWorker>> = endpoints
            .iter()
            .map(|endpoint| {
                let worker = Arc::new(ConnectionWorker::new());
                worker
                    .initialize(Arc::clone(endpoint), Arc::clone(&connector))
                    .map(|_| worker)
            })
            .collect::<Result<_>>()?;

        let (queue_tx, queue_rx) = match config.publishing_strategy {
            PublishingStrategy::Async => {
                let (tx, rx) = mpsc::channel(config.queue_size);
                (Some(tx), Some(rx))
            }
            PublishingStrategy::Sync => (None, None),
        };

        let group = Arc::new(EndpointGroup {
            endpoints,
            workers,
            ha_mode: config.ha_mode,
            queue_tx,
            rr_index: AtomicUsize::new(0),
            reconnection_interval: Duration::from_secs(config.reconnection_interval_secs),
            shutdown: AtomicBool::new(false),
            notify: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        });

        // First connection attempts run concurrently with startup
        for worker in &group.workers {
            let worker = Arc::clone(worker);
            tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    tracing::debug!("initial connection attempt failed: {e}");
                }
            });
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            Arc::clone(&group).run_consumer(queue_rx, failure_rx),
        ));
        tasks.push(tokio::spawn(Arc::clone(&group).run_supervisor()));
        *group.tasks.lock() = tasks;

        Ok(group)
    }

    /// Non-blocking, best-effort publish
    ///
    /// With a queue, fails fast with [`AgentError::QueueFull`] when capacity
    /// is exhausted. With the sync strategy, fails with
    /// [`AgentError::NoEndpoint`] when no connection is active.
    pub async fn try_publish(&self, event: ThrottleEvent) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(AgentError::Shutdown);
        }
        match &self.queue_tx {
            Some(tx) => tx.try_send(event).map_err(|e| match e {
                TrySendError::Full(_) => AgentError::QueueFull,
                TrySendError::Closed(_) => AgentError::Shutdown,
            }),
            None => self.try_sync_publish(event).await,
        }
    }

    /// Blocking publish: waits while at least one connection is reachable
    ///
    /// The event is dropped (with an error) only once every connection in
    /// the group is `Unavailable`.
    pub async fn publish(&self, event: ThrottleEvent) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(AgentError::Shutdown);
        }
        match &self.queue_tx {
            Some(tx) => {
                let mut event = event;
                loop {
                    match tx.try_send(event) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Closed(_)) => return Err(AgentError::Shutdown),
                        Err(TrySendError::Full(returned)) => {
                            if !self.any_reachable() {
                                tracing::error!(
                                    "dropping event: queue full and no receiver reachable"
                                );
                                return Err(AgentError::NoEndpoint);
                            }
                            event = returned;
                            tokio::time::sleep(QUEUE_FULL_WAIT).await;
                        }
                    }
                }
            }
            None => match self.select_endpoint(true, None).await {
                Some(endpoint) => {
                    endpoint.sync_send(event).await;
                    Ok(())
                }
                None => {
                    tracing::error!("dropping event: no receiver reachable");
                    Err(AgentError::NoEndpoint)
                }
            },
        }
    }

    async fn try_sync_publish(&self, event: ThrottleEvent) -> Result<()> {
        match self.select_endpoint(false, None).await {
            Some(endpoint) => {
                endpoint.sync_send(event).await;
                Ok(())
            }
            None => Err(AgentError::NoEndpoint),
        }
    }

    /// Re-route a failed connection's events through its peers
    ///
    /// Events that still cannot be placed re-enter the normal publish path
    /// instead of being dropped outright.
    pub(crate) async fn try_resend_events(&self, events: Vec<ThrottleEvent>, failed_index: usize) {
        let mut unplaced = Vec::new();
        for event in events {
            match self.select_endpoint(false, Some(failed_index)).await {
                Some(endpoint) => endpoint.collect_and_send(event).await,
                None => unplaced.push(event),
            }
        }
        self.flush_all_active().await;

        for event in unplaced {
            let requeued = match &self.queue_tx {
                Some(tx) => tx.try_send(event).map_err(|e| match e {
                    TrySendError::Full(_) => AgentError::QueueFull,
                    TrySendError::Closed(_) => AgentError::Shutdown,
                }),
                None => self.try_sync_publish(event).await,
            };
            if let Err(e) = requeued {
                tracing::error!("unable to requeue event after endpoint failure: {e}");
            }
        }
    }

    /// Pick the next sendable endpoint under the group's HA policy
    ///
    /// Failover always restarts the walk at index 0 and waits out a busy or
    /// initializing primary rather than skipping to a cold standby.
    /// Load-balance starts from the shared round-robin counter. With
    /// `block`, a fruitless lap sleeps and retries for as long as any
    /// connection is still reachable.
    async fn select_endpoint(
        &self,
        block: bool,
        exclude: Option<usize>,
    ) -> Option<Arc<Endpoint>> {
        let count = self.endpoints.len();
        let start = match self.ha_mode {
            HaMode::Loadbalance => self.rr_index.fetch_add(1, Ordering::Relaxed) % count,
            HaMode::Failover => 0,
        };

        let mut index = start;
        loop {
            let shutting_down = self.shutdown.load(Ordering::Acquire);
            let endpoint = &self.endpoints[index];
            let state = endpoint.state();

            if state == EndpointState::Active && exclude != Some(index) {
                return Some(Arc::clone(endpoint));
            }

            if self.ha_mode == HaMode::Failover
                && !shutting_down
                && matches!(state, EndpointState::Busy | EndpointState::Initializing)
            {
                // The primary is expected back shortly; wait instead of
                // failing over to a cold standby
                tokio::time::sleep(BUSY_WAIT).await;
                continue;
            }

            index = (index + 1) % count;
            if index == start {
                let can_wait = block && !shutting_down && self.any_reachable();
                if !can_wait {
                    return None;
                }
                tokio::time::sleep(BUSY_WAIT).await;
            }
        }
    }

    fn any_reachable(&self) -> bool {
        self.endpoints
            .iter()
            .any(|endpoint| endpoint.state() != EndpointState::Unavailable)
    }

    async fn flush_all_active(&self) {
        for endpoint in &self.endpoints {
            if endpoint.state() == EndpointState::Active {
                endpoint.flush_events().await;
            }
        }
    }

    async fn run_consumer(
        self: Arc<Self>,
        queue_rx: Option<mpsc::Receiver<ThrottleEvent>>,
        mut failure_rx: mpsc::UnboundedReceiver<(Vec<ThrottleEvent>, usize)>,
    ) {
        let mut queue_rx = queue_rx;
        // Logged once per outage, not once per event
        let mut dropping = false;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match &mut queue_rx {
                Some(rx) => {
                    tokio::select! {
                        _ = self.notify.notified() => break,
                        failed = failure_rx.recv() => match failed {
                            Some((events, index)) => self.try_resend_events(events, index).await,
                            None => break,
                        },
                        received = rx.recv() => match received {
                            Some(event) => {
                                self.consume(event, &mut dropping).await;
                                // Drain the burst, then flush the batch tails
                                loop {
                                    match rx.try_recv() {
                                        Ok(event) => self.consume(event, &mut dropping).await,
                                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                                    }
                                }
                                self.flush_all_active().await;
                            }
                            None => break,
                        },
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => break,
                        failed = failure_rx.recv() => match failed {
                            Some((events, index)) => self.try_resend_events(events, index).await,
                            None => break,
                        },
                    }
                }
            }
        }
        tracing::debug!("endpoint group consumer stopped");
    }

    async fn consume(&self, event: ThrottleEvent, dropping: &mut bool) {
        match self.select_endpoint(true, None).await {
            Some(endpoint) => {
                *dropping = false;
                endpoint.collect_and_send(event).await;
            }
            None => {
                // No retry path here: requeueing during an extended outage
                // would grow without bound
                if !*dropping {
                    tracing::error!("no receiver reachable, dropping queued events");
                }
                *dropping = true;
            }
        }
    }

    async fn run_supervisor(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => break,
                _ = tokio::time::sleep(self.reconnection_interval) => {}
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.reconnection_cycle().await;
        }
        tracing::debug!("reconnection supervisor stopped");
    }

    async fn reconnection_cycle(&self) {
        let mut any_connected = false;
        let mut unreachable = Vec::new();

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if !endpoint.is_connected() {
                if let Err(e) = self.workers[index].run().await {
                    tracing::debug!(
                        receiver = %endpoint.receiver_url(),
                        "reconnection attempt failed: {e}"
                    );
                }
            } else if !endpoint.probe().await {
                endpoint.deactivate();
            }

            if endpoint.is_connected() {
                any_connected = true;
            } else {
                unreachable.push(endpoint.receiver_url().to_string());
            }
        }

        // One aggregated line per cycle, not one per endpoint
        if !any_connected {
            tracing::warn!(
                "no receiver reachable at reconnection ({}), retrying every {}s",
                unreachable.join(", "),
                self.reconnection_interval.as_secs()
            );
        }
    }

    /// Stop the consumer and supervisor, then tear down every connection
    ///
    /// Idempotent; later calls return immediately.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        for (index, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.state() == EndpointState::Active {
                endpoint.flush_events().await;
            }
            if let Err(e) = self.workers[index].disconnect().await {
                tracing::warn!(
                    receiver = %endpoint.receiver_url(),
                    "error during endpoint teardown: {e}"
                );
            }
        }
        tracing::info!("endpoint group shut down");
    }

    #[cfg(test)]
    pub(crate) fn endpoint(&self, index: usize) -> &Arc<Endpoint> {
        &self.endpoints[index]
    }
}

impl std::fmt::Debug for EndpointGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointGroup")
            .field("ha_mode", &self.ha_mode)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}
