//! One physical connection to a remote aggregator
//!
//! An [`Endpoint`] owns the authenticated client for a single receiver,
//! batches events per connection, and reports send failures back to its
//! group so in-flight events can be re-routed.

use crate::config::EndpointConfig;
use crate::error::{AgentError, Result};
use crate::event::{AggregatorClient, ThrottleEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{Semaphore, mpsc};

/// Connection state machine
///
/// `Initializing → Active` on connect+login, `Initializing → Unavailable`
/// on auth failure, `Active ↔ Busy` as send capacity fills and frees,
/// `Active → Unavailable` on probe failure or send failure,
/// `Unavailable → Active` when the reconnection supervisor succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Initializing,
    Active,
    Busy,
    Unavailable,
}

impl EndpointState {
    fn from_u8(value: u8) -> EndpointState {
        match value {
            0 => EndpointState::Initializing,
            1 => EndpointState::Active,
            2 => EndpointState::Busy,
            _ => EndpointState::Unavailable,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EndpointState::Initializing => 0,
            EndpointState::Active => 1,
            EndpointState::Busy => 2,
            EndpointState::Unavailable => 3,
        }
    }
}

/// Channel carrying failed batches back to the group for re-routing
pub(crate) type FailureSender = mpsc::UnboundedSender<(Vec<ThrottleEvent>, usize)>;

pub struct Endpoint {
    index: usize,
    config: EndpointConfig,
    state: AtomicU8,
    client: tokio::sync::Mutex<Option<Box<dyn AggregatorClient>>>,
    session_id: Mutex<Option<String>>,
    batch: Mutex<Vec<ThrottleEvent>>,
    batch_size: usize,
    send_permits: Semaphore,
    failure_tx: FailureSender,
}

impl Endpoint {
    pub(crate) fn new(
        index: usize,
        config: EndpointConfig,
        batch_size: usize,
        max_pool_size: usize,
        failure_tx: FailureSender,
    ) -> Self {
        Endpoint {
            index,
            config,
            state: AtomicU8::new(EndpointState::Initializing.as_u8()),
            client: tokio::sync::Mutex::new(None),
            session_id: Mutex::new(None),
            batch: Mutex::new(Vec::with_capacity(batch_size)),
            batch_size,
            send_permits: Semaphore::new(max_pool_size),
            failure_tx,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn receiver_url(&self) -> &str {
        &self.config.receiver_url
    }

    pub(crate) fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: EndpointState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn activate(&self) {
        self.set_state(EndpointState::Active);
    }

    pub(crate) fn deactivate(&self) {
        self.set_state(EndpointState::Unavailable);
    }

    /// Anything but `Unavailable` counts as logically connected
    pub fn is_connected(&self) -> bool {
        self.state() != EndpointState::Unavailable
    }

    /// Store the authenticated client and mark the connection active
    pub(crate) async fn install_session(
        &self,
        client: Box<dyn AggregatorClient>,
        session_id: String,
    ) {
        *self.client.lock().await = Some(client);
        *self.session_id.lock() = Some(session_id);
        self.activate();
    }

    /// Remove and return the client plus its session for teardown
    pub(crate) async fn take_session(&self) -> Option<(Box<dyn AggregatorClient>, Option<String>)> {
        let client = self.client.lock().await.take()?;
        let session = self.session_id.lock().take();
        Some((client, session))
    }

    /// Buffer one event, sending the batch when it reaches the batch size
    pub async fn collect_and_send(&self, event: ThrottleEvent) {
        let full_batch = {
            let mut batch = self.batch.lock();
            batch.push(event);
            if batch.len() >= self.batch_size {
                Some(std::mem::take(&mut *batch))
            } else {
                None
            }
        };
        if let Some(events) = full_batch {
            self.send_batch(events).await;
        }
    }

    /// Send whatever is buffered, if anything
    pub async fn flush_events(&self) {
        let pending = {
            let mut batch = self.batch.lock();
            if batch.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut *batch))
            }
        };
        if let Some(events) = pending {
            self.send_batch(events).await;
        }
    }

    /// Send one event immediately, bypassing the batch buffer
    pub async fn sync_send(&self, event: ThrottleEvent) {
        self.send_batch(vec![event]).await;
    }

    async fn send_batch(&self, events: Vec<ThrottleEvent>) {
        // Nearly out of send capacity: dip to busy so selection prefers a
        // peer (or waits, in failover mode) until a permit frees
        if self.send_permits.available_permits() <= 1 && self.state() == EndpointState::Active {
            self.set_state(EndpointState::Busy);
        }

        let permit = match self.send_permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let result = self.publish_with_relogin(&events).await;
        drop(permit);

        if let Err(e) = result {
            tracing::error!(
                receiver = %self.config.receiver_url,
                "unable to send events to endpoint: {e}"
            );
            self.deactivate();
            // Hand the batch back to the group for re-routing
            let _ = self.failure_tx.send((events, self.index));
        }

        // Only a busy endpoint flips back; a deactivated one stays down
        // until the reconnection supervisor brings it back
        if self.state() == EndpointState::Busy {
            self.activate();
        }
    }

    async fn publish_with_relogin(&self, events: &[ThrottleEvent]) -> Result<()> {
        let client_guard = self.client.lock().await;
        let client = client_guard.as_deref().ok_or(AgentError::NotInitialized)?;
        let session = self
            .session_id
            .lock()
            .clone()
            .ok_or(AgentError::SessionExpired)?;

        match client.publish(&session, events).await {
            Err(AgentError::SessionExpired) => {
                // The receiver timed our session out; log in again once
                let renewed = client
                    .login(&self.config.username, &self.config.password)
                    .await?;
                *self.session_id.lock() = Some(renewed.clone());
                client.publish(&renewed, events).await
            }
            other => other,
        }
    }

    /// Lightweight liveness check against the remote receiver
    pub(crate) async fn probe(&self) -> bool {
        let client_guard = self.client.lock().await;
        match client_guard.as_deref() {
            Some(client) => client.probe().await,
            None => false,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("index", &self.index)
            .field("receiver_url", &self.config.receiver_url)
            .field("state", &self.state())
            .finish()
    }
}
