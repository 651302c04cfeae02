//! # Resilience Patterns
//!
//! Primitives the invocation pipeline wraps around every remote call.
//!
//! ## Patterns Included
//!
//! - **Circuit Breaker**: Rolling-window breaker that fails fast while a service is unhealthy
//! - **Bulkhead**: Per-service in-flight limit, rejecting rather than queueing
//! - **Timeout**: Per-attempt deadline
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trellis_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::from_command("order.create", &command));
//!
//! let result = breaker.call(|| async {
//!     remote_call().await
//! }).await;
//! ```

mod bulkhead;
mod circuit_breaker;
mod timeout;

pub use bulkhead::*;
pub use circuit_breaker::*;
pub use timeout::*;
