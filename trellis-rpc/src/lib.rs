//! # Trellis RPC
//!
//! The client side of a Trellis node: resolves a service id to its route,
//! filters endpoints by health, selects one, and executes the call under the
//! service's resilience policy.
//!
//! ## Features
//!
//! - **Failover**: Retry on untried endpoints up to `failover_cluster` attempts
//! - **Circuit Breaker**: Per-service rolling-window breaker with half-open probing
//! - **Concurrency Gate**: Reject calls over `max_concurrent_requests`
//! - **Timeouts**: Per-attempt `execution_timeout`
//! - **Fallbacks and Result Cache**: Opt-in per service command
//! - **Local Services**: Typed handler registry and an in-process transport
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_core::{EndpointAddress, RemoteFault, ServiceDescriptor};
//! use trellis_discovery::{HealthMonitor, HealthMonitorConfig, InMemoryBackend, RouteTable, RouteTableConfig, TcpProbe};
//! use trellis_rpc::{InvokeRequest, LocalTransport, RemoteInvoker, ServiceEntryRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = EndpointAddress::new("127.0.0.1", 9000);
//!
//!     let services = Arc::new(ServiceEntryRegistry::new());
//!     services.register(ServiceDescriptor::new("echo"), |text: serde_json::Value| async move {
//!         Ok::<_, RemoteFault>(text)
//!     });
//!
//!     let routes = RouteTable::new(Arc::new(InMemoryBackend::new()), RouteTableConfig::new("/trellis/routes"));
//!     routes.set_routes(services.routes(&endpoint)).await?;
//!
//!     let transport = Arc::new(LocalTransport::new());
//!     transport.bind(endpoint, services);
//!
//!     let health = HealthMonitor::new(HealthMonitorConfig::default(), Arc::new(TcpProbe::default()));
//!     let invoker = RemoteInvoker::builder(routes, health, transport).build();
//!
//!     let reply = invoker.invoke("echo", InvokeRequest::new().param("text", "hi")).await?;
//!     println!("{}", reply);
//!     Ok(())
//! }
//! ```

mod cache;
mod command;
mod config;
mod diagnostics;
mod error;
mod fallback;
mod invoker;
mod registry;
mod transport;

pub use cache::ResultCache;
pub use command::ServiceCommandProvider;
pub use config::{InvokerConfig, InvokerConfigBuilder};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use error::{ErrorKind, Result, RpcError};
pub use fallback::{Fallback, FallbackFn, FallbackRegistry};
pub use invoker::{InvokeRequest, RemoteInvoker, RemoteInvokerBuilder};
pub use registry::{CODE_BAD_PARAMETERS, CODE_INTERNAL, CODE_NOT_FOUND, LocalTransport, ServiceEntryRegistry};
pub use transport::{Transport, TransportError};

/// Prelude for common imports.
///
/// ```
/// use trellis_rpc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::command::ServiceCommandProvider;
    pub use crate::config::InvokerConfig;
    pub use crate::error::{Result, RpcError};
    pub use crate::fallback::Fallback;
    pub use crate::invoker::{InvokeRequest, RemoteInvoker};
    pub use crate::registry::{LocalTransport, ServiceEntryRegistry};
    pub use crate::transport::{Transport, TransportError};
}
