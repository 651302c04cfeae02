//! Per-service resilience policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when an attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailoverStrategy {
    /// Retry on another endpoint, up to `failover_cluster` attempts.
    #[default]
    Failover,
    /// Give up after the first failed attempt.
    FailFast,
}

/// Address selection algorithm for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ShuntStrategy {
    /// Round-robin over the healthy candidates.
    Polling,
    /// Uniform random choice.
    Random,
    /// Consistent hashing on the call's service key.
    #[default]
    HashAlgorithm,
    /// Random choice biased by operator-assigned weights.
    WeightedRandom,
}

/// Resilience policy for one service id.
///
/// Every field has a default, so a partial JSON/TOML document deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCommand {
    /// Failure handling.
    pub strategy: FailoverStrategy,
    /// Maximum attempts for `Failover`.
    pub failover_cluster: u32,
    /// Per-attempt timeout in milliseconds.
    pub execution_timeout_ms: u64,
    /// Keep the breaker open regardless of traffic.
    pub breaker_force_open: bool,
    /// Keep the breaker closed regardless of errors.
    pub breaker_force_closed: bool,
    /// Error percentage at which the breaker opens.
    pub breaker_error_threshold_percentage: u32,
    /// Minimum requests in the window before the breaker may open.
    pub breaker_request_volume_threshold: u32,
    /// Time the breaker stays open before admitting a probe, in milliseconds.
    pub breaker_sleep_window_ms: u64,
    /// In-flight call limit.
    pub max_concurrent_requests: usize,
    /// Serve repeated calls from the result cache.
    pub request_cache_enabled: bool,
    /// Address selector.
    pub shunt_strategy: ShuntStrategy,
    /// Use a registered fallback when the call cannot complete.
    pub fallback_enabled: bool,
}

impl Default for ServiceCommand {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::Failover,
            failover_cluster: 3,
            execution_timeout_ms: 1000,
            breaker_force_open: false,
            breaker_force_closed: false,
            breaker_error_threshold_percentage: 50,
            breaker_request_volume_threshold: 20,
            breaker_sleep_window_ms: 5000,
            max_concurrent_requests: 200,
            request_cache_enabled: false,
            shunt_strategy: ShuntStrategy::HashAlgorithm,
            fallback_enabled: false,
        }
    }
}

impl ServiceCommand {
    /// Create a command with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure strategy.
    pub fn strategy(mut self, strategy: FailoverStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the attempt bound.
    pub fn failover_cluster(mut self, attempts: u32) -> Self {
        self.failover_cluster = attempts;
        self
    }

    /// Set the per-attempt timeout.
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Force the breaker open.
    pub fn force_open(mut self, force: bool) -> Self {
        self.breaker_force_open = force;
        self
    }

    /// Force the breaker closed.
    pub fn force_closed(mut self, force: bool) -> Self {
        self.breaker_force_closed = force;
        self
    }

    /// Set the error percentage threshold.
    pub fn error_threshold_percentage(mut self, pct: u32) -> Self {
        self.breaker_error_threshold_percentage = pct;
        self
    }

    /// Set the request volume threshold.
    pub fn request_volume_threshold(mut self, volume: u32) -> Self {
        self.breaker_request_volume_threshold = volume;
        self
    }

    /// Set the breaker sleep window.
    pub fn sleep_window(mut self, window: Duration) -> Self {
        self.breaker_sleep_window_ms = window.as_millis() as u64;
        self
    }

    /// Set the in-flight call limit.
    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Enable the result cache.
    pub fn request_cache(mut self, enabled: bool) -> Self {
        self.request_cache_enabled = enabled;
        self
    }

    /// Set the address selector.
    pub fn shunt_strategy(mut self, strategy: ShuntStrategy) -> Self {
        self.shunt_strategy = strategy;
        self
    }

    /// Enable fallbacks.
    pub fn fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Breaker sleep window.
    pub fn sleep_window_duration(&self) -> Duration {
        Duration::from_millis(self.breaker_sleep_window_ms)
    }

    /// Number of attempts a call may make.
    pub fn max_attempts(&self) -> u32 {
        match self.strategy {
            FailoverStrategy::Failover => self.failover_cluster.max(1),
            FailoverStrategy::FailFast => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cmd = ServiceCommand::default();
        assert_eq!(cmd.failover_cluster, 3);
        assert_eq!(cmd.timeout(), Duration::from_millis(1000));
        assert_eq!(cmd.breaker_error_threshold_percentage, 50);
        assert_eq!(cmd.breaker_request_volume_threshold, 20);
        assert_eq!(cmd.sleep_window_duration(), Duration::from_secs(5));
        assert_eq!(cmd.max_concurrent_requests, 200);
        assert_eq!(cmd.shunt_strategy, ShuntStrategy::HashAlgorithm);
        assert!(!cmd.request_cache_enabled);
        assert!(!cmd.fallback_enabled);
    }

    #[test]
    fn test_partial_document() {
        let cmd: ServiceCommand =
            serde_json::from_str(r#"{"strategy": "FailFast", "shunt_strategy": "Polling"}"#).unwrap();
        assert_eq!(cmd.strategy, FailoverStrategy::FailFast);
        assert_eq!(cmd.shunt_strategy, ShuntStrategy::Polling);
        assert_eq!(cmd.failover_cluster, 3);
        assert_eq!(cmd.max_attempts(), 1);
    }

    #[test]
    fn test_builder() {
        let cmd = ServiceCommand::new()
            .failover_cluster(0)
            .execution_timeout(Duration::from_millis(250))
            .max_concurrent_requests(1);
        assert_eq!(cmd.max_attempts(), 1);
        assert_eq!(cmd.execution_timeout_ms, 250);
        assert_eq!(cmd.max_concurrent_requests, 1);
    }
}
