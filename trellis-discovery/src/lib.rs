//! Service discovery for Trellis
//!
//! This crate keeps a node's view of the cluster current.
//!
//! ## Features
//!
//! - **Route Table** - Live service-id → endpoints map fed by backend watches
//! - **Health Monitor** - Periodic probing with eviction of dead endpoints
//! - **Watch Coordination** - One-shot watch bookkeeping for any backend
//! - **Pluggable Backends** - [`CoordinationBackend`] trait, in-memory implementation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trellis_discovery::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(InMemoryBackend::new());
//!
//!     let routes = RouteTable::new(backend, RouteTableConfig::default());
//!     routes.start().await?;
//!
//!     let monitor = HealthMonitor::new(HealthMonitorConfig::default(), Arc::new(TcpProbe::default()));
//!     monitor.attach(&routes);
//!     monitor.start();
//!
//!     for route in routes.get_routes() {
//!         println!("{} -> {:?}", route.service_id(), route.addresses());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod health;
pub mod memory;
pub mod route_table;
pub mod watch;

pub use backend::{CoordinationBackend, SessionEvent, WatchEvent, WatchEventKind, WatchKind, WatchSink};
pub use error::{DiscoveryError, Result};
pub use health::{
    EndpointEvictor, EndpointHealth, HealthMonitor, HealthMonitorConfig, HealthProbe, MonitorEntry, TcpProbe,
};
pub use memory::InMemoryBackend;
pub use route_table::{RouteEvent, RouteTable, RouteTableConfig};
pub use watch::{WatchCoordinator, WatchEvents, WatchState};
