//! Invoker configuration.

use std::time::Duration;
use trellis_core::selector::DEFAULT_REPLICATION_FACTOR;

/// Invoker configuration.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Lifetime of cached results.
    pub result_cache_ttl: Duration,
    /// Maximum number of cached results.
    pub result_cache_capacity: usize,
    /// Virtual ring entries per endpoint for the hash selector.
    pub replication_factor: usize,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            result_cache_ttl: Duration::from_secs(30),
            result_cache_capacity: 1024,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
        }
    }
}

impl InvokerConfig {
    /// Create a new configuration builder.
    pub fn builder() -> InvokerConfigBuilder {
        InvokerConfigBuilder::default()
    }
}

/// Builder for invoker configuration.
#[derive(Debug, Default)]
pub struct InvokerConfigBuilder {
    config: InvokerConfig,
}

impl InvokerConfigBuilder {
    /// Set how long cached results stay valid.
    pub fn result_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.result_cache_ttl = ttl;
        self
    }

    /// Set the maximum number of cached results.
    pub fn result_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.result_cache_capacity = capacity;
        self
    }

    /// Set the hash ring replication factor.
    pub fn replication_factor(mut self, factor: usize) -> Self {
        self.config.replication_factor = factor;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> InvokerConfig {
        self.config
    }
}
