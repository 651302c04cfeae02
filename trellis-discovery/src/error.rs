//! Discovery errors

use thiserror::Error;
use trellis_core::TrellisError;

/// Errors raised by the coordination backend, the route table and the
/// health monitor.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Coordination backend disconnected")]
    Disconnected,

    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl DiscoveryError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }
}

impl From<TrellisError> for DiscoveryError {
    fn from(err: TrellisError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
