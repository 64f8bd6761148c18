//! Consumption events and the aggregator wire boundary
//!
//! One [`ThrottleEvent`] is emitted per accepted request, carrying the three
//! throttle keys and their per-scope counts at send time. The wire encoding
//! is a compact little-endian frame; the transport behind it is injected via
//! [`AggregatorConnector`], so tests run against in-process mocks while
//! production uses [`TcpConnector`].

use crate::config::{EndpointConfig, Protocol};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

// Frame types of the aggregator session protocol
const MSG_LOGIN: u8 = 1;
const MSG_PUBLISH: u8 = 2;
const MSG_LOGOUT: u8 = 3;

const RESPONSE_OK: u8 = 1;

/// One quota-consumption event bound for the remote aggregators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleEvent {
    pub resource_key: String,
    pub application_key: String,
    pub subscription_key: String,
    pub resource_count: i64,
    pub application_count: i64,
    pub subscription_count: i64,
    pub timestamp: i64,
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(AgentError::Protocol(format!(
            "string of {} bytes exceeds the frame limit",
            s.len()
        )));
    }
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(AgentError::Protocol("truncated string length".to_string()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(AgentError::Protocol("truncated string body".to_string()));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| AgentError::Protocol("string is not valid UTF-8".to_string()))
}

/// Encode one event into `buf`
///
/// Keys are u16-length-prefixed UTF-8, counts and timestamp are i64
/// little-endian. Byte-for-byte stable: existing aggregators depend on it.
///
/// # Errors
///
/// A key longer than the u16 length prefix can carry is a
/// [`AgentError::Protocol`] error; writing it anyway would desync the frame.
pub fn encode_event(event: &ThrottleEvent, buf: &mut BytesMut) -> Result<()> {
    put_str(buf, &event.resource_key)?;
    put_str(buf, &event.application_key)?;
    put_str(buf, &event.subscription_key)?;
    buf.put_i64_le(event.resource_count);
    buf.put_i64_le(event.application_count);
    buf.put_i64_le(event.subscription_count);
    buf.put_i64_le(event.timestamp);
    Ok(())
}

/// Decode one event from `buf` (used by the aggregator side and tests)
pub fn decode_event(buf: &mut Bytes) -> Result<ThrottleEvent> {
    let resource_key = get_str(buf)?;
    let application_key = get_str(buf)?;
    let subscription_key = get_str(buf)?;
    if buf.remaining() < 32 {
        return Err(AgentError::Protocol("truncated event counters".to_string()));
    }
    Ok(ThrottleEvent {
        resource_key,
        application_key,
        subscription_key,
        resource_count: buf.get_i64_le(),
        application_count: buf.get_i64_le(),
        subscription_count: buf.get_i64_le(),
        timestamp: buf.get_i64_le(),
    })
}

/// One authenticated session with a remote aggregator
///
/// Implementations own a single physical connection. All methods take
/// `&self`; implementations serialize access internally.
#[async_trait]
pub trait AggregatorClient: Send + Sync {
    /// Perform the login handshake and return the session id
    async fn login(&self, username: &str, password: &str) -> Result<String>;

    /// Ship a batch of events under an authenticated session
    async fn publish(&self, session_id: &str, events: &[ThrottleEvent]) -> Result<()>;

    /// Tear down the session
    async fn logout(&self, session_id: &str) -> Result<()>;

    /// Lightweight liveness check of the remote receiver
    async fn probe(&self) -> bool;
}

/// Factory producing [`AggregatorClient`]s from endpoint configuration
///
/// This is the injection seam for the wire transport: production wires in
/// [`TcpConnector`], tests substitute in-process fakes.
#[async_trait]
pub trait AggregatorConnector: Send + Sync {
    async fn connect(&self, config: &EndpointConfig) -> Result<Box<dyn AggregatorClient>>;
}

/// TCP implementation of the aggregator session protocol
pub struct TcpAggregatorClient {
    addr: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl TcpAggregatorClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(TcpAggregatorClient {
            addr,
            stream: Mutex::new(stream),
        })
    }

    async fn round_trip(&self, frame: &[u8]) -> Result<Bytes> {
        let mut stream = self.stream.lock().await;
        stream.write_all(frame).await?;
        stream.flush().await?;

        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;
        let status = header[0];
        let body_len =
            u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;

        if status != RESPONSE_OK {
            return Err(AgentError::Protocol(format!(
                "aggregator returned status {status}"
            )));
        }
        Ok(Bytes::from(body))
    }
}

fn frame(msg_type: u8, payload: &BytesMut) -> BytesMut {
    let mut out = BytesMut::with_capacity(payload.len() + 5);
    out.put_u8(msg_type);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(payload);
    out
}

#[async_trait]
impl AggregatorClient for TcpAggregatorClient {
    async fn login(&self, username: &str, password: &str) -> Result<String> {
        let mut payload = BytesMut::new();
        put_str(&mut payload, username)?;
        put_str(&mut payload, password)?;
        let mut body = self
            .round_trip(&frame(MSG_LOGIN, &payload))
            .await
            .map_err(|e| AgentError::Authentication(e.to_string()))?;
        get_str(&mut body).map_err(|e| AgentError::Authentication(e.to_string()))
    }

    async fn publish(&self, session_id: &str, events: &[ThrottleEvent]) -> Result<()> {
        if events.len() > u32::MAX as usize {
            return Err(AgentError::Protocol(format!(
                "batch of {} events exceeds the frame limit",
                events.len()
            )));
        }
        let mut payload = BytesMut::new();
        put_str(&mut payload, session_id)?;
        payload.put_u32_le(events.len() as u32);
        for event in events {
            encode_event(event, &mut payload)?;
        }
        self.round_trip(&frame(MSG_PUBLISH, &payload)).await?;
        Ok(())
    }

    async fn logout(&self, session_id: &str) -> Result<()> {
        let mut payload = BytesMut::new();
        put_str(&mut payload, session_id)?;
        self.round_trip(&frame(MSG_LOGOUT, &payload)).await?;
        Ok(())
    }

    async fn probe(&self) -> bool {
        // Raw connect is enough to tell a dead receiver from a live one
        TcpStream::connect(self.addr).await.is_ok()
    }
}

/// Production connector: resolves the receiver URL and dials TCP
pub struct TcpConnector;

#[async_trait]
impl AggregatorConnector for TcpConnector {
    async fn connect(&self, config: &EndpointConfig) -> Result<Box<dyn AggregatorClient>> {
        let (protocol, host, port) = config.parse_receiver_url()?;
        // Refusing beats silently downgrading an ssl:// receiver to plaintext
        if protocol == Protocol::Ssl {
            return Err(AgentError::Configuration(format!(
                "ssl:// receivers are not supported by the TCP connector: {}",
                config.receiver_url
            )));
        }
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| {
                AgentError::Configuration(format!("receiver host does not resolve: {host}"))
            })?;
        let client = TcpAggregatorClient::connect(addr).await?;
        Ok(Box::new(client))
    }
}
