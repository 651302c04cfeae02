// Trellis - service discovery, health monitoring and failover invocation
//
// The root crate re-exports the member crates and wires them into a node.

mod node;

pub use node::TrellisNode;

pub use trellis_config;
pub use trellis_core;
pub use trellis_discovery;
pub use trellis_rpc;

#[cfg(feature = "testing")]
pub use trellis_testing;

pub use trellis_core::{
    EndpointAddress, FailoverStrategy, InvokeMessage, InvokeResult, RemoteFault, ServiceCommand, ServiceDescriptor,
    ServiceRoute, ShuntStrategy,
};

// Prelude for common imports
pub mod prelude {
    pub use crate::TrellisNode;
    pub use trellis_config::{ConfigManager, TrellisSettings};
    pub use trellis_core::resilience::CircuitState;
    pub use trellis_core::{
        EndpointAddress, FailoverStrategy, InvokeMessage, InvokeResult, RemoteFault, ServiceCommand,
        ServiceDescriptor, ServiceRoute, ShuntStrategy,
    };
    pub use trellis_discovery::{
        CoordinationBackend, HealthMonitor, HealthProbe, InMemoryBackend, RouteEvent, RouteTable, TcpProbe,
    };
    pub use trellis_rpc::{
        Diagnostics, Fallback, InvokeRequest, LocalTransport, RemoteInvoker, RpcError, ServiceEntryRegistry, Transport,
    };
}
