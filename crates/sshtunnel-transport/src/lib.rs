//! Transport abstraction layer for tunnel sessions
//!
//! This crate provides the transport-agnostic traits the tunnel core is written
//! against. A transport is an authenticated connection to a gateway host that can
//! open forwarded byte streams to arbitrary `host:port` targets on the gateway's
//! side of the network.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   sshtunnel-proxy                        │
//! │        (supervisor, sessions, relays, shutdown)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            sshtunnel-transport (this crate)              │
//! │   - TransportConnector    - TransportConnection          │
//! │   - ForwardedStream       - Endpoint                     │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ sshtunnel-transport-ssh  │  test loopback transports    │
//! └──────────────────────────┴──────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid key material: {0}")]
    KeyError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Failed to open forwarded stream to {target}: {reason}")]
    ChannelOpenFailed { target: String, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A `host:port` pair naming a gateway or a forwarding target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A duplex byte stream opened through a transport
///
/// Anything tokio can read from and write to qualifies; the SSH transport hands
/// out channel streams, tests hand out TCP sockets or in-memory duplex pipes.
pub trait ForwardedStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ForwardedStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An authenticated connection to a gateway
///
/// One connection is owned by exactly one tunnel session. It is shared between
/// the session's tasks behind an `Arc`, so every method takes `&self`.
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug + 'static {
    /// The stream type produced by [`open_forwarded`](Self::open_forwarded)
    type Stream: ForwardedStream;

    /// Ask the gateway to open a TCP connection to `target` and return a stream
    /// carrying its bytes
    async fn open_forwarded(&self, target: &Endpoint) -> TransportResult<Self::Stream>;

    /// Close the connection
    ///
    /// Must be idempotent: the second and later calls return immediately and
    /// never report an error.
    async fn close(&self);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get a unique stable identifier for this connection (for logging)
    fn connection_id(&self) -> String;
}

/// Client-side: establishes transport connections to a gateway
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug + 'static {
    /// The connection type created by this connector
    type Connection: TransportConnection;

    /// Dial and authenticate against `gateway`
    async fn connect(&self, gateway: &Endpoint) -> TransportResult<Self::Connection>;

    /// Get a human-readable name for this transport (e.g., "SSH")
    fn name(&self) -> &str;
}

/// One-shot close latch shared by transport implementations
///
/// `mark_closed` returns `true` only for the caller that actually performed the
/// transition, so the real teardown runs exactly once no matter how many tasks
/// race to close.
#[derive(Debug, Default)]
pub struct CloseFlag {
    closed: AtomicBool,
}

impl CloseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
