//! Connection worker: connect, authenticate, tear down
//!
//! One [`ConnectionWorker`] serves one [`Endpoint`] for the endpoint's
//! lifetime. `initialize` binds the worker exactly once; `run` may be
//! invoked repeatedly, once per connection attempt.

use crate::endpoint::{Endpoint, EndpointState};
use crate::error::{AgentError, Result};
use crate::event::AggregatorConnector;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

struct WorkerTarget {
    endpoint: Arc<Endpoint>,
    connector: Arc<dyn AggregatorConnector>,
}

pub struct ConnectionWorker {
    initialized: AtomicBool,
    target: Mutex<Option<WorkerTarget>>,
}

impl ConnectionWorker {
    pub fn new() -> Self {
        ConnectionWorker {
            initialized: AtomicBool::new(false),
            target: Mutex::new(None),
        }
    }

    /// Bind this worker to its endpoint and transport factory
    ///
    /// # Errors
    ///
    /// A second call returns [`AgentError::AlreadyInitialized`]; a worker is
    /// bound to exactly one endpoint for its whole life.
    pub fn initialize(
        &self,
        endpoint: Arc<Endpoint>,
        connector: Arc<dyn AggregatorConnector>,
    ) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(AgentError::AlreadyInitialized);
        }
        *self.target.lock() = Some(WorkerTarget {
            endpoint,
            connector,
        });
        Ok(())
    }

    fn target(&self) -> Result<(Arc<Endpoint>, Arc<dyn AggregatorConnector>)> {
        let guard = self.target.lock();
        let target = guard.as_ref().ok_or(AgentError::NotInitialized)?;
        Ok((Arc::clone(&target.endpoint), Arc::clone(&target.connector)))
    }

    /// One connection attempt: dial, authenticate, obtain a session id
    ///
    /// On success the endpoint transitions to `Active`; on connect or
    /// authentication failure it transitions to `Unavailable`.
    pub async fn run(&self) -> Result<()> {
        let (endpoint, connector) = self.target()?;
        endpoint.set_state(EndpointState::Initializing);

        let client = match connector.connect(endpoint.config()).await {
            Ok(client) => client,
            Err(e) => {
                endpoint.deactivate();
                return Err(e);
            }
        };

        let config = endpoint.config();
        match client.login(&config.username, &config.password).await {
            Ok(session_id) => {
                tracing::debug!(
                    receiver = %config.receiver_url,
                    "connected and authenticated to aggregator"
                );
                endpoint.install_session(client, session_id).await;
                Ok(())
            }
            Err(e) => {
                endpoint.deactivate();
                Err(AgentError::Authentication(format!(
                    "login to {} failed: {e}",
                    config.auth_url
                )))
            }
        }
    }

    /// Log out and drop the endpoint's client
    ///
    /// A failed logout invalidates the client anyway rather than leaking a
    /// broken transport back into circulation.
    pub async fn disconnect(&self) -> Result<()> {
        let (endpoint, _connector) = self.target()?;
        if let Some((client, session)) = endpoint.take_session().await {
            if let Some(session_id) = session {
                if let Err(e) = client.logout(&session_id).await {
                    tracing::warn!(
                        receiver = %endpoint.receiver_url(),
                        "logout failed, discarding connection: {e}"
                    );
                }
            }
        }
        endpoint.deactivate();
        Ok(())
    }
}

impl Default for ConnectionWorker {
    fn default() -> Self {
        Self::new()
    }
}
