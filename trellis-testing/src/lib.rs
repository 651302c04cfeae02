//! Testing utilities for Trellis nodes.
//!
//! ## Features
//!
//! - **TestCluster** - A node wired against in-memory coordination
//! - **MockTransport** - Per-endpoint scripted answers with a call log
//! - **ScriptedProbe** - Health probe with scripted results
//! - **Assertions** - Error kind, breaker state and route assertions
//! - **Load Testing** - Concurrent call bursts with outcome tallies
//!
//! ## Quick Start
//!
//! ```
//! use trellis_testing::*;
//! use trellis_rpc::InvokeRequest;
//!
//! # tokio_test::block_on(async {
//! let cluster = TestCluster::builder()
//!     .with_service("order.create", [node(1), node(2), node(3)])
//!     .stopped()
//!     .build()
//!     .await;
//!
//! cluster.transport.take_down(&[node(1), node(2)]);
//! let reply = cluster.invoke("order.create", InvokeRequest::new()).await.unwrap();
//! assert_eq!(reply["endpoint"], "10.0.0.3:80");
//! # });
//! ```
//!
//! ## Scripting Endpoints
//!
//! ```
//! use trellis_testing::{Behavior, MockTransport, node};
//!
//! let transport = MockTransport::new();
//! transport
//!     .set(&node(1), Behavior::fault(409, "duplicate"))
//!     .enqueue(&node(2), Behavior::refuse());
//! assert_eq!(transport.call_count(), 0);
//! ```

mod assertions;
mod mock;
mod test_cluster;

pub mod load;

pub use assertions::{assert_breaker_state, assert_error_kind, assert_no_route, assert_route};
pub use mock::{Behavior, MockTransport, RecordedCall, ScriptedProbe};
pub use test_cluster::{TEST_ROUTE_ROOT, TestCluster, TestClusterBuilder, node};
