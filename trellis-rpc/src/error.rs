//! Invocation error types.

use crate::transport::TransportError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use trellis_discovery::DiscoveryError;

/// Result type for invocation operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Invocation errors.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No route is published for the service id.
    #[error("No route for service: {0}")]
    NoRoute(String),

    /// The route exists but none of its endpoints is usable.
    #[error("No live endpoint for service: {0}")]
    NoLiveEndpoint(String),

    /// The service's circuit breaker rejected the call.
    #[error("Circuit breaker is open for service: {0}")]
    CircuitOpen(String),

    /// The service's concurrency limit is reached.
    #[error("Concurrency limit reached for service: {0}")]
    CapacityExceeded(String),

    /// An attempt did not finish in time.
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The transport failed to deliver the call.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Every allowed attempt failed.
    #[error("Call failed after {attempts} attempts: {last}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<RpcError>,
    },

    /// The remote service reported an application error.
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Application error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// The result could not be decoded into the requested type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Route or health lookup failed.
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Coarse classification of [`RpcError`] for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    NoRoute,
    NoLiveEndpoint,
    CircuitOpen,
    CapacityExceeded,
    Timeout,
    Transport,
    RetryExhausted,
    Remote,
    Decode,
    Discovery,
}

impl RpcError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoRoute(_) => ErrorKind::NoRoute,
            Self::NoLiveEndpoint(_) => ErrorKind::NoLiveEndpoint,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::CapacityExceeded(_) => ErrorKind::CapacityExceeded,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Transport(_) => ErrorKind::Transport,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Discovery(_) => ErrorKind::Discovery,
        }
    }

    /// Check if another endpoint might succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// Whether a registered fallback may replace this error.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen(_)
                | Self::NoLiveEndpoint(_)
                | Self::RetryExhausted { .. }
                | Self::Timeout(_)
                | Self::Transport(_)
        )
    }

    /// Remote error code, if this is an application error.
    pub fn remote_code(&self) -> Option<i32> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}
