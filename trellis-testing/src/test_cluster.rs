// Test cluster builder

use crate::mock::{MockTransport, ScriptedProbe};
use std::collections::HashMap;
use std::sync::Arc;
use trellis_core::{EndpointAddress, ServiceCommand, ServiceDescriptor, ServiceRoute};
use trellis_discovery::{HealthMonitor, HealthMonitorConfig, InMemoryBackend, RouteTable, RouteTableConfig};
use trellis_rpc::{InvokeRequest, InvokerConfig, RemoteInvoker, Result, ServiceCommandProvider};

/// Route root used by test clusters.
pub const TEST_ROUTE_ROOT: &str = "/trellis/routes";

/// A node wired against an in-memory coordination service, a mock
/// transport and a scripted health probe.
pub struct TestCluster {
    pub backend: InMemoryBackend,
    pub routes: Arc<RouteTable>,
    pub health: Arc<HealthMonitor>,
    pub transport: MockTransport,
    pub probe: ScriptedProbe,
    pub invoker: Arc<RemoteInvoker>,
}

impl TestCluster {
    pub fn builder() -> TestClusterBuilder {
        TestClusterBuilder::new()
    }

    /// Call a service through the invoker
    pub async fn invoke(&self, service_id: &str, request: InvokeRequest) -> Result<serde_json::Value> {
        self.invoker.invoke(service_id, request).await
    }

    /// Stop the background loops
    pub async fn shutdown(&self) {
        self.health.shutdown().await;
        self.routes.shutdown().await;
    }
}

/// `10.0.0.<n>:80`
pub fn node(n: u8) -> EndpointAddress {
    EndpointAddress::new(format!("10.0.0.{}", n), 80)
}

/// Builder for test clusters
pub struct TestClusterBuilder {
    services: Vec<ServiceRoute>,
    default_command: ServiceCommand,
    overrides: HashMap<String, ServiceCommand>,
    health_config: HealthMonitorConfig,
    invoker_config: InvokerConfig,
    start: bool,
}

impl TestClusterBuilder {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            default_command: ServiceCommand::default(),
            overrides: HashMap::new(),
            health_config: HealthMonitorConfig::default(),
            invoker_config: InvokerConfig::default(),
            start: true,
        }
    }

    /// Publish a service on the given endpoints
    pub fn with_service(mut self, service_id: &str, endpoints: impl IntoIterator<Item = EndpointAddress>) -> Self {
        self.services
            .push(ServiceRoute::new(ServiceDescriptor::new(service_id), endpoints));
        self
    }

    /// Command applied to services without an override
    pub fn with_default_command(mut self, command: ServiceCommand) -> Self {
        self.default_command = command;
        self
    }

    pub fn with_command(mut self, service_id: &str, command: ServiceCommand) -> Self {
        self.overrides.insert(service_id.to_string(), command);
        self
    }

    pub fn with_health_config(mut self, config: HealthMonitorConfig) -> Self {
        self.health_config = config;
        self
    }

    pub fn with_invoker_config(mut self, config: InvokerConfig) -> Self {
        self.invoker_config = config;
        self
    }

    /// Leave the route table and health monitor loops stopped
    pub fn stopped(mut self) -> Self {
        self.start = false;
        self
    }

    /// Publish the routes and wire the node.
    ///
    /// # Panics
    ///
    /// Panics if a route cannot be published.
    pub async fn build(self) -> TestCluster {
        let backend = InMemoryBackend::new();
        let routes = RouteTable::new(Arc::new(backend.clone()), RouteTableConfig::new(TEST_ROUTE_ROOT));
        routes
            .set_routes(self.services)
            .await
            .expect("Failed to publish test routes");

        let probe = ScriptedProbe::new();
        let health = HealthMonitor::new(self.health_config, Arc::new(probe.clone()));
        if self.start {
            routes.start().await.expect("Failed to start route table");
            health.attach(&routes);
        } else {
            health.set_evictor(routes.clone());
        }

        let transport = MockTransport::new();
        let commands = ServiceCommandProvider::new(self.default_command).with_overrides(self.overrides);
        let invoker = RemoteInvoker::builder(routes.clone(), health.clone(), Arc::new(transport.clone()))
            .config(self.invoker_config)
            .commands(commands)
            .build();

        TestCluster {
            backend,
            routes,
            health,
            transport,
            probe,
            invoker,
        }
    }
}

impl Default for TestClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
