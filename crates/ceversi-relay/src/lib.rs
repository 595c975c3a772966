//! Relay client boundary for ceversi
//!
//! A relay (bootstrap/discovery) server accepts a named lease registration and
//! forwards remote clients' connections to whoever holds the lease. This crate
//! defines the client side of that capability as three traits:
//!
//! - [`RelayConnector`]: builds a client from an ordered list of bootstrap servers
//! - [`RelayClient`]: registers leases and hands out listeners
//! - [`RelayListener`]: yields inbound byte streams for one lease
//!
//! Two implementations ship with the crate:
//!
//! - [`WebSocketRelayConnector`]: talks to a relay over WebSocket (ws:// or wss://)
//! - [`MemoryRelay`]: in-process relay, used by tests and embedders
//!
//! # Example
//!
//! ```ignore
//! use ceversi_relay::{Lease, RelayClient, RelayConfig, RelayConnector, RelayListener};
//! use ceversi_relay::WebSocketRelayConnector;
//!
//! # async fn example() -> Result<(), ceversi_relay::RelayError> {
//! let config = RelayConfig::from_urls(["wss://relay.example.com"])?;
//! let client = WebSocketRelayConnector.connect(&config).await?;
//!
//! let lease = Lease::new("ceversi", ["http/1.1"]).with_tags(["game", "othello"]);
//! let listener = client.listen(lease).await?;
//!
//! while let Ok(stream) = listener.accept().await {
//!     // serve HTTP on `stream`
//! #   drop(stream);
//! }
//!
//! listener.close().await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod lease;
pub mod memory;
pub mod protocol;
pub mod stream;
pub mod websocket;

pub use config::RelayConfig;
pub use lease::Lease;
pub use memory::{MemoryRelay, MemoryRelayClient, MemoryRelayListener};
pub use protocol::ControlMessage;
pub use stream::WsByteStream;
pub use websocket::{WebSocketRelayClient, WebSocketRelayConnector, WebSocketRelayListener};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No bootstrap servers configured")]
    NoBootstrapServers,

    #[error("Invalid bootstrap server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to connect to any bootstrap server: {0}")]
    ConnectionFailed(String),

    #[error("Lease rejected by relay: {0}")]
    Rejected(String),

    #[error("No lease named {0}")]
    LeaseNotFound(String),

    #[error("Relay connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    /// Whether this error is the normal result of closing a listener or client
    pub fn is_closed(&self) -> bool {
        matches!(self, RelayError::Closed)
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Listener for inbound connections addressed to one registered lease
#[async_trait]
pub trait RelayListener: Send + Sync + 'static {
    /// Byte stream carrying one relayed connection
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound connection.
    ///
    /// Returns [`RelayError::Closed`] once the listener or its client is closed,
    /// or the relay dropped the registration.
    async fn accept(&self) -> RelayResult<Self::Stream>;

    /// Deregister the lease and unblock pending `accept` calls. Idempotent.
    async fn close(&self) -> RelayResult<()>;

    /// Relay-assigned identifier of the lease
    fn lease_id(&self) -> &str;

    fn is_closed(&self) -> bool;
}

/// Connected relay client
#[async_trait]
pub trait RelayClient: Send + Sync + 'static {
    type Listener: RelayListener;

    /// Register a lease and obtain a listener for its inbound connections
    async fn listen(&self, lease: Lease) -> RelayResult<Self::Listener>;

    /// Release every registration and disconnect. Idempotent.
    async fn close(&self) -> RelayResult<()>;
}

/// Factory for relay clients
#[async_trait]
pub trait RelayConnector: Send + Sync {
    type Client: RelayClient;

    /// Connect to the first reachable bootstrap server in `config`
    async fn connect(&self, config: &RelayConfig) -> RelayResult<Self::Client>;
}
