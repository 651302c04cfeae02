//! Load Testing Utilities
//!
//! Drives many concurrent calls through a [`RemoteInvoker`] and tallies
//! the outcomes by error kind.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use trellis_rpc::{ErrorKind, InvokeRequest, RemoteInvoker};

/// Load test statistics
#[derive(Debug, Clone)]
pub struct LoadTestStats {
    /// Total number of calls
    pub total_requests: u64,

    /// Successful calls
    pub successful: u64,

    /// Failed calls
    pub failed: u64,

    /// Failed calls by kind
    pub errors: HashMap<ErrorKind, u64>,

    /// Total duration
    pub duration: Duration,

    /// Min response time of successful calls
    pub min_response_time: Duration,

    /// Max response time of successful calls
    pub max_response_time: Duration,

    /// 95th percentile response time
    pub p95_response_time: Duration,
}

impl LoadTestStats {
    /// Calculate statistics from response times
    pub fn from_outcomes(response_times: &[Duration], errors: HashMap<ErrorKind, u64>, total_duration: Duration) -> Self {
        let mut sorted = response_times.to_vec();
        sorted.sort();

        let successful = sorted.len() as u64;
        let failed: u64 = errors.values().sum();
        let max = sorted.last().copied().unwrap_or_default();
        let p95_idx = (sorted.len() as f64 * 0.95) as usize;

        Self {
            total_requests: successful + failed,
            successful,
            failed,
            errors,
            duration: total_duration,
            min_response_time: sorted.first().copied().unwrap_or_default(),
            max_response_time: max,
            p95_response_time: sorted.get(p95_idx).copied().unwrap_or(max),
        }
    }

    /// Failed calls of one kind
    pub fn errors_of(&self, kind: ErrorKind) -> u64 {
        self.errors.get(&kind).copied().unwrap_or(0)
    }
}

/// Load test configuration
#[derive(Debug, Clone)]
pub struct LoadTestConfig {
    /// Number of calls in flight at once
    pub concurrency: usize,

    /// Total number of calls
    pub total_requests: u64,
}

impl LoadTestConfig {
    /// Create new load test config
    ///
    /// # Examples
    ///
    /// ```
    /// use trellis_testing::load::LoadTestConfig;
    ///
    /// let config = LoadTestConfig::new(10, 1000);
    /// assert_eq!(config.concurrency, 10);
    /// ```
    pub fn new(concurrency: usize, total_requests: u64) -> Self {
        Self {
            concurrency: concurrency.max(1),
            total_requests,
        }
    }
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self::new(10, 100)
    }
}

/// Load test runner
pub struct LoadTestRunner<F>
where
    F: Fn(u64) -> InvokeRequest,
{
    config: LoadTestConfig,
    invoker: Arc<RemoteInvoker>,
    service_id: String,
    request_fn: F,
}

impl<F> LoadTestRunner<F>
where
    F: Fn(u64) -> InvokeRequest,
{
    /// Create new load test runner. `request_fn` builds the request for
    /// the n-th call.
    pub fn new(config: LoadTestConfig, invoker: Arc<RemoteInvoker>, service_id: impl Into<String>, request_fn: F) -> Self {
        Self {
            config,
            invoker,
            service_id: service_id.into(),
            request_fn,
        }
    }

    /// Run load test
    pub async fn run(&self) -> LoadTestStats {
        let start_time = Instant::now();
        let invoker = &self.invoker;
        let service_id = self.service_id.as_str();

        let outcomes: Vec<(Duration, Option<ErrorKind>)> = futures::stream::iter(0..self.config.total_requests)
            .map(|n| {
                let request = (self.request_fn)(n);
                async move {
                    let started = Instant::now();
                    let result = invoker.invoke(service_id, request).await;
                    (started.elapsed(), result.err().map(|e| e.kind()))
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        let mut response_times = Vec::with_capacity(outcomes.len());
        let mut errors: HashMap<ErrorKind, u64> = HashMap::new();
        for (elapsed, error) in outcomes {
            match error {
                None => response_times.push(elapsed),
                Some(kind) => *errors.entry(kind).or_insert(0) += 1,
            }
        }

        LoadTestStats::from_outcomes(&response_times, errors, start_time.elapsed())
    }
}
