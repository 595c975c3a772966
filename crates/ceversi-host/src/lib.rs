//! Supervisor for the ceversi game backend
//!
//! A [`Host`] spawns the backend process and reverse-proxies HTTP to it from
//! two places at once:
//!
//! - a relay lease, so remote players reach the game through a bootstrap server
//! - an optional local TCP port for direct access
//!
//! Both listeners share one [`ProxyHandler`]. A [`ShutdownCoordinator`] ties
//! the lifetime of the backend, the listeners and OS signals together.
//!
//! # Example
//!
//! ```ignore
//! use ceversi_host::{config, BackendConfig, Host, HostConfig, ShutdownCoordinator};
//! use ceversi_relay::{RelayConfig, WebSocketRelayConnector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let relay = RelayConfig::from_urls(["wss://relay.example.com"])?;
//! let backend = BackendConfig::new("./server", config::DEFAULT_BACKEND_PORT);
//! let lease = config::lease_from_parts("ceversi", "Othello", "Ceversi", "game", false)?;
//!
//! let config = HostConfig::new(relay, backend, lease).with_local_port(Some(31744));
//!
//! let shutdown = ShutdownCoordinator::new();
//! shutdown.listen_for_signals();
//! Host::new(config, WebSocketRelayConnector, shutdown).run().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod host;
pub mod listener;
pub mod proxy;
pub mod shutdown;

pub use backend::BackendProcess;
pub use config::{BackendConfig, HostConfig};
pub use error::HostError;
pub use host::{Host, RunningHost};
pub use listener::{Acceptor, ListenerSet, TcpAcceptor};
pub use proxy::{ProxyHandler, ProxyTarget};
pub use shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownState};
