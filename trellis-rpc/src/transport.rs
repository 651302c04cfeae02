//! Transport abstraction.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use trellis_core::{EndpointAddress, InvokeMessage, InvokeResult};

/// Delivery failures. Any of these makes the attempt count as failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection broke before a result arrived.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// The peer answered with something that is not an invocation result.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Moves an [`InvokeMessage`] to an endpoint and brings back the result.
///
/// Implementations should give up after `timeout`; the pipeline also
/// enforces it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &EndpointAddress,
        message: &InvokeMessage,
        timeout: Duration,
    ) -> Result<InvokeResult, TransportError>;
}
