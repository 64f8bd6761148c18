//! # Quotamesh Agent
//!
//! Gateway-side throttling agent: local admission decisions backed by the
//! [`quotamesh`] window store, with asynchronous counting and
//! high-availability event publishing to remote aggregators.
//!
//! ## Architecture
//!
//! ```text
//! check_and_consume ──► window store (decision, in-memory)
//!         │
//!         └─► dispatch pool ──► workers ──► store.update ×3 scopes
//!                                   │
//!                                   └─► endpoint group ──► bounded queue
//!                                              │
//!                                         consumer task
//!                                    (failover / loadbalance)
//!                                              │
//!                                    endpoint ──► aggregator
//! ```
//!
//! The request path never blocks on the network: `check_and_consume` reads
//! only in-memory counters, and everything downstream of the dispatch pool
//! is best-effort. A reconnection supervisor revives dead aggregator
//! connections in the background.
//!
//! ## Quick Start
//!
//! ```no_run
//! use quotamesh_agent::{
//!     AgentConfig, EndpointConfig, ScopeQuota, TcpConnector, ThrottleEngine, ThrottleRequest,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> quotamesh_agent::Result<()> {
//! let endpoints = vec![EndpointConfig {
//!     receiver_url: "tcp://tm1.local:9611".to_string(),
//!     auth_url: "tcp://tm1.local:9711".to_string(),
//!     username: "admin".to_string(),
//!     password: "admin".to_string(),
//!     trust_store_path: None,
//! }];
//! let engine = ThrottleEngine::start(AgentConfig::default(), endpoints, Arc::new(TcpConnector))?;
//!
//! let decision = engine
//!     .check_and_consume(ThrottleRequest {
//!         resource: ScopeQuota {
//!             key: "/orders:GET".to_string(),
//!             limit: 1000,
//!             unit_count: 1,
//!             time_unit: "min".to_string(),
//!             stop_on_quota: true,
//!         },
//!         application: ScopeQuota {
//!             key: "app:shop".to_string(),
//!             limit: 10_000,
//!             unit_count: 1,
//!             time_unit: "hour".to_string(),
//!             stop_on_quota: true,
//!         },
//!         subscription: ScopeQuota {
//!             key: "sub:gold".to_string(),
//!             limit: 100_000,
//!             unit_count: 1,
//!             time_unit: "day".to_string(),
//!             stop_on_quota: false,
//!         },
//!         timestamp: 0,
//!     })
//!     .await?;
//! assert!(!decision.throttled);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod event;
pub mod group;

pub use config::{AgentConfig, EndpointConfig, HaMode, Protocol, PublishingStrategy};
pub use endpoint::EndpointState;
pub use engine::{ScopeQuota, ThrottleDecision, ThrottleEngine, ThrottleRequest};
pub use error::{AgentError, Result};
pub use event::{AggregatorClient, AggregatorConnector, TcpConnector, ThrottleEvent};
pub use group::EndpointGroup;
