//! Ceversi - serves the Othello/Reversi backend through a relay
//!
//! Spawns the game server, registers a lease with the relay and proxies HTTP to
//! the backend from the relay and, optionally, a local port.

use anyhow::{Context, Result};
use ceversi_host::config::{
    lease_from_parts, local_port_from_flag, DEFAULT_BACKEND_PORT, DEFAULT_LOCAL_PORT,
};
use ceversi_host::{BackendConfig, Host, HostConfig, HostError, ShutdownCoordinator};
use ceversi_relay::{RelayConfig, WebSocketRelayConnector};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Secondary environment variable for the bootstrap server list
const RELAY_URL_ENV: &str = "RELAY_URL";

/// Ceversi - Othello/Reversi game host
#[derive(Parser, Debug)]
#[command(name = "ceversi")]
#[command(about = "Ceversi - serve the Othello/Reversi game through a relay")]
#[command(version = env!("CEVERSI_GIT_TAG"))]
#[command(long_version = concat!(env!("CEVERSI_GIT_TAG"), "\nCommit: ", env!("CEVERSI_GIT_HASH"), "\nBuilt: ", env!("CEVERSI_BUILD_TIME")))]
#[command(long_about = r#"
Ceversi starts the game server, registers it with a relay under a lease name,
and proxies HTTP from the relay (and optionally a local port) to the game.

EXAMPLES:
  # Register with a relay and serve locally on the default port
  ceversi --server-url wss://relay.example.com

  # Relay only, with a custom game server binary
  ceversi --server-url wss://relay.example.com --port -1 --c-server ./build/server

ENVIRONMENT VARIABLES:
  RELAY                  Bootstrap servers (comma-separated), RELAY_URL also accepted
  CEVERSI_PORT           Local HTTP port (negative disables)
  CEVERSI_BACKEND_PORT   Port the game server listens on
  CEVERSI_C_SERVER       Path to the game server executable
  RUST_LOG               Log filter, overrides --log-level
"#)]
struct Cli {
    /// Relay bootstrap server URLs (e.g., wss://relay.example.com)
    #[arg(long, env = "RELAY", value_delimiter = ',')]
    server_url: Vec<String>,

    /// Local HTTP port (negative disables the local listener)
    #[arg(long, env = "CEVERSI_PORT", default_value_t = DEFAULT_LOCAL_PORT, allow_negative_numbers = true)]
    port: i32,

    /// Port the game server listens on
    #[arg(long, env = "CEVERSI_BACKEND_PORT", default_value_t = DEFAULT_BACKEND_PORT)]
    backend_port: u16,

    /// Lease name
    #[arg(long, env = "CEVERSI_NAME", default_value = "ceversi")]
    name: String,

    /// Hide the lease from relay listings
    #[arg(long, env = "CEVERSI_HIDE")]
    hide: bool,

    /// Lease description
    #[arg(
        long,
        env = "CEVERSI_DESCRIPTION",
        default_value = "Simple Othello/Reversi game written in C"
    )]
    description: String,

    /// Lease tags (comma-separated)
    #[arg(long, env = "CEVERSI_TAGS", default_value = "game,othello,reversi")]
    tags: String,

    /// Lease owner
    #[arg(long, env = "CEVERSI_OWNER", default_value = "Ceversi")]
    owner: String,

    /// Path to the game server executable
    #[arg(long, env = "CEVERSI_C_SERVER", default_value = "./server")]
    c_server: PathBuf,

    /// Seconds to wait for relay registration (0 = no limit)
    #[arg(long, env = "CEVERSI_REGISTER_TIMEOUT", default_value_t = 0)]
    register_timeout: u64,

    /// Seconds to wait for the game server port to open (0 = skip)
    #[arg(long, env = "CEVERSI_READY_TIMEOUT", default_value_t = 10)]
    ready_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    /// Bootstrap servers from the flag or `RELAY`, falling back to `RELAY_URL`
    fn bootstrap_servers(&self) -> Vec<String> {
        if !self.server_url.is_empty() {
            return self.server_url.clone();
        }
        std::env::var(RELAY_URL_ENV)
            .map(|value| value.split(',').map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn into_config(self) -> Result<HostConfig> {
        let relay = RelayConfig::from_urls(self.bootstrap_servers())
            .context("Invalid relay configuration (set --server-url, RELAY or RELAY_URL)")?;

        let backend = BackendConfig::new(self.c_server, self.backend_port)
            .with_ready_timeout(seconds(self.ready_timeout));

        let lease = lease_from_parts(
            &self.name,
            &self.description,
            &self.owner,
            &self.tags,
            self.hide,
        )
        .context("Invalid lease")?;

        let local_port = local_port_from_flag(self.port).context("Invalid --port")?;

        Ok(HostConfig::new(relay, backend, lease)
            .with_local_port(local_port)
            .with_register_timeout(seconds(self.register_timeout)))
    }
}

/// Zero means "not set"
fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Setup logging; `RUST_LOG` takes precedence over `--log-level`
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    info!("Ceversi {} starting", env!("CEVERSI_GIT_TAG"));
    info!(
        "Relay: {}",
        config
            .relay
            .bootstrap_servers
            .iter()
            .map(|url| url.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!(
        "Backend: {} on port {}",
        config.backend.executable.display(),
        config.backend.port
    );

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.listen_for_signals();

    let result = Host::new(config, WebSocketRelayConnector, shutdown).run().await;
    signals.abort();

    match result {
        Ok(()) => {
            info!("Ceversi stopped");
            Ok(())
        }
        Err(HostError::Cancelled) => {
            info!("Ceversi stopped before startup completed");
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ceversi").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_defaults() {
        let cli = parse(&["--server-url", "wss://relay.example.com"]);
        assert_eq!(cli.port, 31744);
        assert_eq!(cli.backend_port, 31745);
        assert_eq!(cli.name, "ceversi");
        assert_eq!(cli.c_server, PathBuf::from("./server"));

        let config = cli.into_config().unwrap();
        assert_eq!(config.local_port, Some(31744));
        assert_eq!(config.register_timeout, None);
        assert_eq!(config.backend.ready_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.lease.tags, vec!["game", "othello", "reversi"]);
        assert_eq!(config.lease.owner, "Ceversi");
        assert!(!config.lease.hide);
    }

    #[test]
    fn test_negative_port_and_server_list() {
        let cli = parse(&[
            "--server-url",
            "wss://a.example.com,https://b.example.com",
            "--port",
            "-1",
            "--ready-timeout",
            "0",
            "--register-timeout",
            "30",
            "--hide",
        ]);
        let config = cli.into_config().unwrap();

        assert_eq!(config.local_port, None);
        assert_eq!(config.backend.ready_timeout, None);
        assert_eq!(config.register_timeout, Some(Duration::from_secs(30)));
        assert!(config.lease.hide);

        let servers: Vec<&str> = config
            .relay
            .bootstrap_servers
            .iter()
            .map(|url| url.as_str())
            .collect();
        assert_eq!(servers, ["wss://a.example.com/", "wss://b.example.com/"]);
    }

    #[test]
    fn test_port_out_of_range_is_rejected() {
        let cli = parse(&["--server-url", "wss://relay.example.com", "--port", "70000"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn test_build_stamps() {
        let hash = env!("CEVERSI_GIT_HASH");
        assert!(
            hash == "unknown" || (!hash.is_empty() && hash.chars().all(|c| c.is_ascii_hexdigit())),
            "unexpected commit stamp {:?}",
            hash
        );
        assert!(!env!("CEVERSI_GIT_TAG").is_empty());
        assert!(chrono::DateTime::parse_from_rfc3339(env!("CEVERSI_BUILD_TIME")).is_ok());
    }
}
