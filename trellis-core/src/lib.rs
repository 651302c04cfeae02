//! Core types and primitives for Trellis.
//!
//! This crate holds the pieces every other Trellis crate builds on:
//!
//! - [`EndpointAddress`], [`ServiceDescriptor`] and [`ServiceRoute`], the
//!   values the registry stores and the pipeline resolves
//! - [`ServiceCommand`], the per-service resilience policy
//! - [`InvokeMessage`] / [`InvokeResult`], the invocation envelope
//! - [`selector`]: the consistent hash ring and the address selectors
//! - [`resilience`]: circuit breaker, bulkhead and per-attempt timeout
//! - [`logging`]: `tracing` subscriber setup

pub mod command;
pub mod endpoint;
pub mod error;
pub mod invocation;
pub mod logging;
pub mod resilience;
pub mod route;
pub mod selector;

pub use command::{FailoverStrategy, ServiceCommand, ShuntStrategy};
pub use endpoint::EndpointAddress;
pub use error::{Result, TrellisError};
pub use invocation::{InvokeMessage, InvokeResult, RemoteFault};
pub use route::{AuthorizationKind, ServiceDescriptor, ServiceRoute, normalize_path};
pub use selector::{AddressSelector, ConsistentHash, SelectionContext, SelectorSet, selector_for};
