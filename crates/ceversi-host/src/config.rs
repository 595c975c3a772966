//! Host configuration
//!
//! Built once at startup and never mutated. Everything a run needs is here, so
//! the run itself takes no other inputs besides the relay connector.

use ceversi_relay::{Lease, RelayConfig};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::HostError;
use crate::proxy::ProxyTarget;

/// Default local HTTP port
pub const DEFAULT_LOCAL_PORT: i32 = 31744;

/// Default backend HTTP port
pub const DEFAULT_BACKEND_PORT: u16 = 31745;

/// Grace period for in-flight requests during shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Protocols announced on the lease
pub const LEASE_PROTOCOLS: [&str; 1] = ["http/1.1"];

/// How the backend process is launched
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub executable: PathBuf,
    pub port: u16,
    /// How long to probe the backend port after spawn; `None` skips the probe
    pub ready_timeout: Option<Duration>,
}

impl BackendConfig {
    pub fn new(executable: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            executable: executable.into(),
            port,
            ready_timeout: None,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub relay: RelayConfig,
    pub backend: BackendConfig,
    pub lease: Lease,
    /// Local HTTP port; `None` disables the local listener
    pub local_port: Option<u16>,
    /// Bound on relay connect + registration; `None` waits indefinitely
    pub register_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl HostConfig {
    pub fn new(relay: RelayConfig, backend: BackendConfig, lease: Lease) -> Self {
        Self {
            relay,
            backend,
            lease,
            local_port: None,
            register_timeout: None,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_local_port(mut self, port: Option<u16>) -> Self {
        self.local_port = port;
        self
    }

    pub fn with_register_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.register_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Upstream the proxy forwards to
    pub fn proxy_target(&self) -> ProxyTarget {
        ProxyTarget::local(self.backend.port)
    }

    /// Bind address of the local listener, if enabled
    pub fn local_bind_addr(&self) -> Option<SocketAddr> {
        self.local_port
            .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }
}

/// Interpret a `--port` value: negative disables the local listener
pub fn local_port_from_flag(port: i32) -> Result<Option<u16>, HostError> {
    if port < 0 {
        return Ok(None);
    }
    u16::try_from(port)
        .map(Some)
        .map_err(|_| HostError::InvalidConfig(format!("local port {} is out of range", port)))
}

/// Build the lease announced to the relay
pub fn lease_from_parts(
    name: &str,
    description: &str,
    owner: &str,
    tags: &str,
    hide: bool,
) -> Result<Lease, HostError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HostError::InvalidConfig(
            "lease name must not be empty".to_string(),
        ));
    }

    Ok(Lease::new(name, LEASE_PROTOCOLS)
        .with_description(description)
        .with_owner(owner)
        .with_tags(tags.split(','))
        .with_hide(hide))
}
