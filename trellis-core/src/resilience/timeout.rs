//! Per-attempt timeouts.
//!
//! Every attempt of a remote call runs under its own deadline; an attempt
//! that overruns is abandoned and reported as [`TimeoutError::Elapsed`], which
//! callers treat the same as a transport failure.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trellis_core::resilience::Timeout;
//! use std::time::Duration;
//!
//! let timeout = Timeout::new("order.create", Duration::from_millis(1000));
//! let result = timeout.call(|| transport.invoke(&endpoint, &message)).await;
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Timeout error.
#[derive(Debug)]
pub enum TimeoutError<E> {
    /// The attempt did not finish in time.
    Elapsed(Duration),
    /// The attempt finished with an error.
    Execution(E),
}

impl<E> TimeoutError<E> {
    /// Whether the deadline was hit.
    pub fn is_elapsed(&self) -> bool {
        matches!(self, Self::Elapsed(_))
    }
}

impl<E: std::fmt::Display> std::fmt::Display for TimeoutError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Elapsed(d) => write!(f, "Operation timed out after {:?}", d),
            Self::Execution(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for TimeoutError<E> {}

/// Deadline applied to one attempt.
#[derive(Debug, Clone)]
pub struct Timeout {
    name: String,
    duration: Duration,
}

impl Timeout {
    /// Create a timeout for the named service.
    pub fn new(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            duration,
        }
    }

    /// Get the timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute with timeout.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, TimeoutError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.duration, f()).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(TimeoutError::Execution(e)),
            Err(_) => {
                warn!(
                    service_id = %self.name,
                    duration = ?self.duration,
                    "Attempt timed out"
                );
                Err(TimeoutError::Elapsed(self.duration))
            }
        }
    }
}

/// Execute a future with a timeout.
pub async fn with_timeout<F, Fut, T>(duration: Duration, f: F) -> Result<T, Duration>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    tokio::time::timeout(duration, f())
        .await
        .map_err(|_| duration)
}
