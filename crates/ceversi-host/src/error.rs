//! Host errors

use ceversi_relay::RelayError;
use std::time::Duration;
use thiserror::Error;

/// Errors that end a run
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to start backend {path}: {source}")]
    BackendSpawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to relay: {0}")]
    RelayConnect(#[source] RelayError),

    #[error("Failed to register lease: {0}")]
    RelayListen(#[source] RelayError),

    #[error("Relay registration did not complete within {0:?}")]
    RegistrationTimeout(Duration),

    #[error("Backend exited unexpectedly: {0}")]
    BackendExited(String),

    #[error("Startup interrupted by shutdown request")]
    Cancelled,
}

impl HostError {
    /// Startup errors abort the run before anything is served
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            HostError::InvalidConfig(_)
                | HostError::BackendSpawn { .. }
                | HostError::RelayConnect(_)
                | HostError::RelayListen(_)
                | HostError::RegistrationTimeout(_)
        )
    }
}
