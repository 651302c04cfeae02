//! Bulkhead pattern for per-service concurrency limits.
//!
//! A bulkhead caps the number of in-flight calls to one service. Calls over
//! the limit are rejected immediately; nothing is queued.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trellis_core::resilience::{Bulkhead, BulkheadConfig};
//!
//! let bulkhead = Bulkhead::new(BulkheadConfig::new("order.create", 200));
//!
//! let Some(permit) = bulkhead.try_acquire() else {
//!     return Err(RpcError::CapacityExceeded { .. });
//! };
//! // ... call, permit released on drop
//! ```

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Bulkhead configuration.
#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Name of the bulkhead (the guarded service id).
    pub name: String,
    /// Maximum concurrent executions.
    pub max_concurrent: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: 200,
        }
    }
}

impl BulkheadConfig {
    /// Create a new configuration.
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            max_concurrent,
        }
    }
}

/// Bulkhead error.
#[derive(Debug)]
pub enum BulkheadError<E> {
    /// Bulkhead is full, request rejected.
    Full,
    /// Execution failed.
    Execution(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BulkheadError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "Bulkhead is full"),
            Self::Execution(e) => write!(f, "Execution failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BulkheadError<E> {}

/// Slot held for the duration of one call.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bulkhead for limiting concurrent access.
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
}

impl Bulkhead {
    /// Create a new bulkhead.
    pub fn new(config: BulkheadConfig) -> Arc<Self> {
        tracing::info!(
            name = %config.name,
            max_concurrent = config.max_concurrent,
            "Bulkhead initialized"
        );

        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    /// Get the bulkhead name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get available permits.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get current number of active executions.
    pub fn active_count(&self) -> usize {
        self.config.max_concurrent - self.available_permits()
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> Option<BulkheadPermit> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Some(BulkheadPermit { _permit: permit }),
            Err(_) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(name = %self.config.name, "Bulkhead full, rejecting request");
                None
            }
        }
    }

    /// Execute immediately if a slot is free.
    pub async fn try_call<F, Fut, T, E>(&self, f: F) -> Result<T, BulkheadError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.try_acquire().ok_or(BulkheadError::Full)?;
        f().await.map_err(BulkheadError::Execution)
    }

    /// Get bulkhead statistics.
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            name: self.config.name.clone(),
            max_concurrent: self.config.max_concurrent,
            active_count: self.active_count(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }
}

/// Bulkhead statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BulkheadStats {
    /// Bulkhead name.
    pub name: String,
    /// Maximum concurrent executions.
    pub max_concurrent: usize,
    /// Current active executions.
    pub active_count: usize,
    /// Total calls.
    pub total_calls: u64,
    /// Total rejections.
    pub total_rejections: u64,
}

impl BulkheadStats {
    /// Calculate utilization (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent == 0 {
            1.0
        } else {
            self.active_count as f64 / self.max_concurrent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bulkhead_allows_call() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 2));

        let result: Result<i32, BulkheadError<&str>> = bulkhead.try_call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test]
    async fn test_bulkhead_rejects_when_full() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 1));

        let permit = bulkhead.try_acquire().unwrap();
        assert_eq!(bulkhead.active_count(), 1);

        let result: Result<i32, BulkheadError<&str>> = bulkhead.try_call(|| async { Ok(42) }).await;
        assert!(matches!(result, Err(BulkheadError::Full)));

        drop(permit);
        assert!(bulkhead.try_acquire().is_some());

        let stats = bulkhead.stats();
        assert_eq!(stats.total_rejections, 1);
        assert_eq!(stats.total_calls, 3);
    }

    #[tokio::test]
    async fn test_zero_capacity_rejects_everything() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new("test", 0));
        assert!(bulkhead.try_acquire().is_none());
        assert_eq!(bulkhead.stats().utilization(), 1.0);
    }
}
