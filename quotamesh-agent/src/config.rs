//! Agent and endpoint configuration
//!
//! All tunables arrive from the policy/config loader as plain structs; there
//! is no CLI layer here. Configuration mistakes (bad HA mode, malformed
//! receiver URL) are fatal at startup and surfaced as typed errors, never
//! silently defaulted.

use crate::error::{AgentError, Result};
use serde::Deserialize;

/// High-availability mode for an endpoint group
///
/// - **Failover**: connection 0 is the primary, peers are cold standbys
/// - **Loadbalance**: events round-robin across active connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaMode {
    Failover,
    Loadbalance,
}

impl std::str::FromStr for HaMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "failover" => Ok(HaMode::Failover),
            "loadbalance" => Ok(HaMode::Loadbalance),
            _ => Err(AgentError::Configuration(format!(
                "invalid HA mode: {s}. Valid options are: failover, loadbalance"
            ))),
        }
    }
}

/// How events reach the endpoint group
///
/// - **Async**: events pass through the bounded queue and a consumer task
/// - **Sync**: events go straight to an endpoint on the caller's task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishingStrategy {
    Sync,
    Async,
}

impl std::str::FromStr for PublishingStrategy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(PublishingStrategy::Sync),
            "async" => Ok(PublishingStrategy::Async),
            _ => Err(AgentError::Configuration(format!(
                "invalid publishing strategy: {s}. Valid options are: sync, async"
            ))),
        }
    }
}

/// Global agent tunables
///
/// Defaults match the upstream gateway's shipped agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Event queue capacity (async strategy only)
    pub queue_size: usize,
    /// Events buffered per endpoint before a batched network write
    pub batch_size: usize,
    /// Concurrent sends allowed per endpoint before it reads as busy
    pub max_pool_size: usize,
    /// HA mode for the endpoint group
    pub ha_mode: HaMode,
    /// Sync or queued publishing
    pub publishing_strategy: PublishingStrategy,
    /// Seconds between reconnection supervisor cycles
    pub reconnection_interval_secs: u64,
    /// Dispatch jobs created eagerly at startup
    pub agent_pool_initial_size: usize,
    /// Ceiling on pooled dispatch jobs
    pub agent_pool_max_size: usize,
    /// Worker tasks applying dispatched counter updates
    pub dispatch_workers: usize,
    /// Bounded depth of the dispatch job queue
    pub dispatch_queue_depth: usize,
    /// Seconds between sweeper passes over the counter store
    pub sweep_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            queue_size: 32_768,
            batch_size: 200,
            max_pool_size: 1,
            ha_mode: HaMode::Failover,
            publishing_strategy: PublishingStrategy::Async,
            reconnection_interval_secs: 30,
            agent_pool_initial_size: 16,
            agent_pool_max_size: 256,
            dispatch_workers: 4,
            dispatch_queue_depth: 1_024,
            sweep_interval_secs: 3_600,
        }
    }
}

impl AgentConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a [`AgentError::Configuration`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            return Err(AgentError::Configuration(
                "queue_size must be greater than zero".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AgentError::Configuration(
                "batch_size must be greater than zero".to_string(),
            ));
        }
        if self.max_pool_size == 0 {
            return Err(AgentError::Configuration(
                "max_pool_size must be greater than zero".to_string(),
            ));
        }
        if self.dispatch_workers == 0 {
            return Err(AgentError::Configuration(
                "dispatch_workers must be greater than zero".to_string(),
            ));
        }
        if self.dispatch_queue_depth == 0 {
            return Err(AgentError::Configuration(
                "dispatch_queue_depth must be greater than zero".to_string(),
            ));
        }
        if self.agent_pool_max_size < self.agent_pool_initial_size {
            return Err(AgentError::Configuration(
                "agent_pool_max_size must be at least agent_pool_initial_size".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(AgentError::Configuration(
                "sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport protocol of a receiver URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Ssl,
}

/// One remote aggregator endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Receiver URL, `tcp://host:port` or `ssl://host:port`
    pub receiver_url: String,
    /// Login/session handshake URL (may equal the receiver URL)
    pub auth_url: String,
    pub username: String,
    pub password: String,
    /// TLS trust material for ssl:// receivers
    pub trust_store_path: Option<String>,
}

impl EndpointConfig {
    /// Split the receiver URL into protocol, host and port
    ///
    /// # Errors
    ///
    /// Malformed URLs are configuration errors and fail loudly.
    pub fn parse_receiver_url(&self) -> Result<(Protocol, String, u16)> {
        parse_url(&self.receiver_url)
    }
}

fn parse_url(url: &str) -> Result<(Protocol, String, u16)> {
    let (scheme, rest) = url.split_once("://").ok_or_else(|| {
        AgentError::Configuration(format!("malformed receiver URL (missing scheme): {url}"))
    })?;
    let protocol = match scheme.to_lowercase().as_str() {
        "tcp" => Protocol::Tcp,
        "ssl" => Protocol::Ssl,
        _ => {
            return Err(AgentError::Configuration(format!(
                "unsupported receiver protocol: {scheme}"
            )));
        }
    };
    let (host, port) = rest.split_once(':').ok_or_else(|| {
        AgentError::Configuration(format!("malformed receiver URL (missing port): {url}"))
    })?;
    if host.is_empty() {
        return Err(AgentError::Configuration(format!(
            "malformed receiver URL (empty host): {url}"
        )));
    }
    let port: u16 = port.parse().map_err(|_| {
        AgentError::Configuration(format!("malformed receiver URL (bad port): {url}"))
    })?;
    Ok((protocol, host.to_string(), port))
}
