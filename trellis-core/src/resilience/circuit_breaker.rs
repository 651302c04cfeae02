//! Circuit Breaker pattern implementation.
//!
//! The breaker watches the outcome of calls to one service over a rolling
//! window and opens when the service is failing often enough to be worth
//! shielding.
//!
//! ## States
//!
//! - **Closed**: Requests pass through; outcomes are counted in a bucketed
//!   rolling window. Once the window holds at least `request_volume_threshold`
//!   requests and the error percentage reaches `error_threshold_percentage`,
//!   the circuit opens.
//! - **Open**: Requests are rejected without being attempted until
//!   `sleep_window` has elapsed.
//! - **Half-Open**: Exactly one probing request is admitted. Success closes the
//!   circuit and resets the window; failure reopens it and restarts the sleep
//!   window.
//!
//! `force_open` rejects everything; `force_closed` admits everything and never
//! trips, while still counting outcomes.
//!
//! ## Example
//!
//! ```rust,ignore
//! use trellis_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("order.create")
//!         .request_volume_threshold(10)
//!         .error_threshold_percentage(50)
//!         .sleep_window(Duration::from_secs(5)),
//! );
//!
//! if let Some(mut permit) = breaker.try_acquire() {
//!     match call_remote().await {
//!         Ok(_) => permit.record_success(),
//!         Err(_) => permit.record_failure(),
//!     }
//! }
//! ```

use crate::command::ServiceCommand;
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests are rejected.
    Open,
    /// Circuit is half-open, testing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the circuit breaker (the guarded service id).
    pub name: String,
    /// Error percentage at or above which the circuit opens.
    pub error_threshold_percentage: u32,
    /// Minimum requests in the window before the circuit may open.
    pub request_volume_threshold: u32,
    /// Time to stay open before admitting a probe.
    pub sleep_window: Duration,
    /// Length of the rolling statistics window.
    pub rolling_window: Duration,
    /// Number of buckets the rolling window is split into.
    pub buckets: u32,
    /// Reject every request.
    pub force_open: bool,
    /// Admit every request and never trip.
    pub force_closed: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            error_threshold_percentage: 50,
            request_volume_threshold: 20,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(10),
            buckets: 10,
            force_open: false,
            force_closed: false,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Build the breaker settings carried by a service command.
    pub fn from_command(name: impl Into<String>, command: &ServiceCommand) -> Self {
        Self {
            name: name.into(),
            error_threshold_percentage: command.breaker_error_threshold_percentage,
            request_volume_threshold: command.breaker_request_volume_threshold,
            sleep_window: command.sleep_window_duration(),
            force_open: command.breaker_force_open,
            force_closed: command.breaker_force_closed,
            ..Default::default()
        }
    }

    /// Set the error percentage threshold.
    pub fn error_threshold_percentage(mut self, pct: u32) -> Self {
        self.error_threshold_percentage = pct;
        self
    }

    /// Set the request volume threshold.
    pub fn request_volume_threshold(mut self, volume: u32) -> Self {
        self.request_volume_threshold = volume;
        self
    }

    /// Set the sleep window.
    pub fn sleep_window(mut self, window: Duration) -> Self {
        self.sleep_window = window;
        self
    }

    /// Set the rolling window length and bucket count.
    pub fn rolling_window(mut self, window: Duration, buckets: u32) -> Self {
        self.rolling_window = window;
        self.buckets = buckets;
        self
    }

    /// Force the circuit open.
    pub fn force_open(mut self, force: bool) -> Self {
        self.force_open = force;
        self
    }

    /// Force the circuit closed.
    pub fn force_closed(mut self, force: bool) -> Self {
        self.force_closed = force;
        self
    }
}

/// Circuit breaker error.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request was rejected.
    Open,
    /// Request was executed but failed.
    Execution(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Circuit breaker is open"),
            Self::Execution(e) => write!(f, "Execution failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

// ============================================================================
// Rolling Window
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch: u64,
    requests: u64,
    errors: u64,
}

/// Request/error counts over the last `buckets * bucket_width`.
#[derive(Debug)]
struct RollingWindow {
    origin: Instant,
    bucket_width_ms: u64,
    buckets: Vec<Bucket>,
}

impl RollingWindow {
    fn new(span: Duration, buckets: u32) -> Self {
        let count = buckets.max(1) as u64;
        Self {
            origin: Instant::now(),
            bucket_width_ms: (span.as_millis() as u64 / count).max(1),
            buckets: vec![Bucket::default(); count as usize],
        }
    }

    fn epoch(&self, now: Instant) -> u64 {
        now.duration_since(self.origin).as_millis() as u64 / self.bucket_width_ms
    }

    fn record(&mut self, now: Instant, error: bool) {
        let epoch = self.epoch(now);
        let len = self.buckets.len() as u64;
        let slot = &mut self.buckets[(epoch % len) as usize];
        if slot.epoch != epoch {
            *slot = Bucket {
                epoch,
                ..Default::default()
            };
        }
        slot.requests += 1;
        if error {
            slot.errors += 1;
        }
    }

    /// (requests, errors) still inside the window.
    fn totals(&self, now: Instant) -> (u64, u64) {
        let epoch = self.epoch(now);
        let len = self.buckets.len() as u64;
        self.buckets
            .iter()
            .filter(|b| b.requests > 0 && b.epoch + len > epoch)
            .fold((0, 0), |(r, e), b| (r + b.requests, e + b.errors))
    }

    fn reset(&mut self) {
        self.buckets.fill(Bucket::default());
        self.origin = Instant::now();
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Internal circuit breaker state.
struct CircuitBreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    window: RollingWindow,
    /// Ticket of the Half-Open probe currently in flight.
    probe: Option<u64>,
    next_ticket: u64,
}

/// Circuit breaker guarding one service.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<CircuitBreakerState>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        info!(
            name = %config.name,
            error_threshold_percentage = config.error_threshold_percentage,
            request_volume_threshold = config.request_volume_threshold,
            sleep_window = ?config.sleep_window,
            "Circuit breaker initialized"
        );

        let window = RollingWindow::new(config.rolling_window, config.buckets);
        Arc::new(Self {
            config,
            inner: RwLock::new(CircuitBreakerState {
                state: CircuitState::Closed,
                opened_at: None,
                window,
                probe: None,
                next_ticket: 0,
            }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    /// Get the circuit breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current circuit state.
    pub fn state(&self) -> CircuitState {
        if self.config.force_open {
            return CircuitState::Open;
        }
        if self.config.force_closed {
            return CircuitState::Closed;
        }
        self.maybe_transition_to_half_open();
        self.inner.read().state
    }

    /// Ask for admission of one request.
    ///
    /// In Half-Open only the first caller is admitted, as the probe. The probe
    /// slot is held by the returned permit until an outcome is recorded on it;
    /// dropping the permit without an outcome frees the slot again.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        let admitted = if self.config.force_open {
            None
        } else if self.config.force_closed {
            Some(None)
        } else {
            self.maybe_transition_to_half_open();
            let mut inner = self.inner.write();
            match inner.state {
                CircuitState::Closed => Some(None),
                CircuitState::Open => None,
                CircuitState::HalfOpen if inner.probe.is_some() => None,
                CircuitState::HalfOpen => {
                    let ticket = inner.next_ticket;
                    inner.next_ticket += 1;
                    inner.probe = Some(ticket);
                    debug!(name = %self.config.name, ticket, "Admitting half-open probe");
                    Some(Some(ticket))
                }
            }
        };

        match admitted {
            Some(probe) => {
                self.total_requests.fetch_add(1, Ordering::Relaxed);
                Some(BreakerPermit {
                    breaker: Arc::clone(self),
                    probe,
                    settled: false,
                })
            }
            None => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(name = %self.config.name, "Circuit breaker rejected request");
                None
            }
        }
    }

    /// Execute a function with circuit breaker protection.
    pub async fn call<F, Fut, T, E>(self: &Arc<Self>, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(mut permit) = self.try_acquire() else {
            return Err(CircuitBreakerError::Open);
        };

        match f().await {
            Ok(result) => {
                permit.record_success();
                Ok(result)
            }
            Err(e) => {
                permit.record_failure();
                Err(CircuitBreakerError::Execution(e))
            }
        }
    }

    /// Record a successful operation that holds no permit.
    ///
    /// Counts in the Closed window only; it never settles a Half-Open probe.
    pub fn record_success(&self) {
        self.record(None, false);
    }

    /// Record a failed operation that holds no permit.
    pub fn record_failure(&self) {
        self.record(None, true);
    }

    fn record(&self, ticket: Option<u64>, error: bool) {
        if error {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => {
                inner.window.record(Instant::now(), error);
                self.trip_if_unhealthy(&mut inner);
            }
            CircuitState::HalfOpen if ticket.is_some() && ticket == inner.probe => {
                inner.probe = None;
                if error {
                    warn!(name = %self.config.name, state = "Open", "Circuit breaker probe failed, reopening");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                } else {
                    info!(name = %self.config.name, state = "Closed", "Circuit breaker CLOSED");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    inner.window.reset();
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                // Late result of a call admitted before the circuit opened
                debug!(name = %self.config.name, error, "Ignoring outcome outside the closed window");
            }
        }
    }

    fn release_probe(&self, ticket: u64) {
        let mut inner = self.inner.write();
        if inner.state == CircuitState::HalfOpen && inner.probe == Some(ticket) {
            debug!(name = %self.config.name, ticket, "Half-open probe released without an outcome");
            inner.probe = None;
        }
    }

    fn trip_if_unhealthy(&self, inner: &mut CircuitBreakerState) {
        if self.config.force_closed {
            return;
        }

        let (requests, errors) = inner.window.totals(Instant::now());
        if requests < self.config.request_volume_threshold as u64 || requests == 0 {
            return;
        }

        let error_pct = errors * 100 / requests;
        if error_pct >= self.config.error_threshold_percentage as u64 {
            warn!(
                name = %self.config.name,
                state = "Open",
                requests,
                errors,
                error_pct,
                "Circuit breaker OPENED"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Transition to half-open state if the sleep window has elapsed.
    fn maybe_transition_to_half_open(&self) {
        let inner = self.inner.read();
        if inner.state != CircuitState::Open {
            return;
        }

        if let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.sleep_window
        {
            drop(inner);

            let mut inner = self.inner.write();
            if inner.state == CircuitState::Open {
                debug!(name = %self.config.name, state = "HalfOpen", "Circuit breaker transitioning to HALF-OPEN");
                inner.state = CircuitState::HalfOpen;
                inner.probe = None;
            }
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.window.reset();
        inner.probe = None;
    }

    /// (requests, errors) in the current rolling window.
    pub fn window_counts(&self) -> (u64, u64) {
        self.inner.read().window.totals(Instant::now())
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let (window_requests, window_errors) = self.window_counts();
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: self.state(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            window_requests,
            window_errors,
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// A permit that is dropped before any outcome is recorded (the call never
/// reached a service, or its future was cancelled) gives a Half-Open probe
/// slot back so the next caller can probe instead.
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: Option<u64>,
    settled: bool,
}

impl BreakerPermit {
    /// Whether this permit is the Half-Open probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Record a successful attempt made under this permit.
    pub fn record_success(&mut self) {
        self.settled = true;
        self.breaker.record(self.probe, false);
    }

    /// Record a failed attempt made under this permit.
    pub fn record_failure(&mut self) {
        self.settled = true;
        self.breaker.record(self.probe, true);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled
            && let Some(ticket) = self.probe
        {
            self.breaker.release_probe(ticket);
        }
    }
}

impl std::fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("breaker", &self.breaker.name())
            .field("probe", &self.probe)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Circuit breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Admitted requests.
    pub total_requests: u64,
    /// Total successes.
    pub total_successes: u64,
    /// Total failures.
    pub total_failures: u64,
    /// Total rejections.
    pub total_rejections: u64,
    /// Requests in the rolling window.
    pub window_requests: u64,
    /// Errors in the rolling window.
    pub window_errors: u64,
}

impl CircuitBreakerStats {
    /// Error rate in the rolling window (0.0 - 1.0).
    pub fn window_error_rate(&self) -> f64 {
        if self.window_requests == 0 {
            0.0
        } else {
            self.window_errors as f64 / self.window_requests as f64
        }
    }
}
