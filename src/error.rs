use crate::service::ServiceKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Failed to spawn {service}: {reason}")]
    Spawn { service: ServiceKind, reason: String },

    #[error("Port {port} for {service} is held by a process that does not answer health checks")]
    PortConflict { service: ServiceKind, port: u16 },

    #[error("External {service} server at {url} is unreachable")]
    ExternalUnreachable { service: ServiceKind, url: String },

    #[error("{service} did not become healthy within {timeout:?}")]
    VerifyTimeout {
        service: ServiceKind,
        timeout: Duration,
    },

    #[error("Required service {service} failed to start after {attempts} attempts")]
    RequiredServiceFailed { service: ServiceKind, attempts: u32 },

    #[error("Startup did not complete within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    #[error("A restart of {service} is already in progress")]
    RestartInProgress { service: ServiceKind },

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("System error: {message}")]
    System { message: String },
}

impl WardenError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn spawn<S: Into<String>>(service: ServiceKind, reason: S) -> Self {
        Self::Spawn {
            service,
            reason: reason.into(),
        }
    }

    /// Whether this error must propagate to the host instead of being absorbed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WardenError::RequiredServiceFailed { .. } | WardenError::StartupTimeout { .. }
        )
    }
}

/// Subscriber-side event bus failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Receiver lagged behind by {skipped} events")]
    Lagged { skipped: u64 },

    #[error("Event bus channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, WardenError>;
