// Error types for the Trellis core types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrellisError {
    #[error("Invalid endpoint address: {0}")]
    InvalidAddress(String),

    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid route data: {0}")]
    InvalidRoute(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TrellisError {
    /// Create an invalid address error.
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create an invalid descriptor error.
    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    /// Create an invalid route error.
    pub fn invalid_route(msg: impl Into<String>) -> Self {
        Self::InvalidRoute(msg.into())
    }
}

impl From<serde_json::Error> for TrellisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
