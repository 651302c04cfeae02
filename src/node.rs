//! A Trellis node assembled from settings.

use std::sync::Arc;
use tracing::info;
use trellis_config::TrellisSettings;
use trellis_core::EndpointAddress;
use trellis_discovery::{
    CoordinationBackend, HealthMonitor, HealthMonitorConfig, HealthProbe, Result, RouteTable, RouteTableConfig,
};
use trellis_rpc::{
    Diagnostics, InvokerConfig, RemoteInvoker, ServiceCommandProvider, ServiceEntryRegistry, Transport,
};

/// Route table, health monitor, invoker and local services of one process.
///
/// ```
/// use std::sync::Arc;
/// use trellis::prelude::*;
///
/// # tokio_test::block_on(async {
/// let node = TrellisNode::new(
///     TrellisSettings::default(),
///     Arc::new(InMemoryBackend::new()),
///     Arc::new(LocalTransport::new()),
///     Arc::new(TcpProbe::default()),
/// );
/// assert!(node.routes().is_empty());
/// # });
/// ```
pub struct TrellisNode {
    settings: TrellisSettings,
    services: Arc<ServiceEntryRegistry>,
    routes: Arc<RouteTable>,
    health: Arc<HealthMonitor>,
    invoker: Arc<RemoteInvoker>,
}

impl TrellisNode {
    pub fn new(
        settings: TrellisSettings,
        backend: Arc<dyn CoordinationBackend>,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let routes = RouteTable::new(
            backend.clone(),
            RouteTableConfig::new(settings.registry.route_root.clone()),
        );

        let health = HealthMonitor::new(
            HealthMonitorConfig::default()
                .probe_interval(settings.health.probe_interval())
                .probe_timeout(settings.health.probe_timeout())
                .eviction_threshold(settings.health.eviction_threshold),
            probe,
        );

        let commands = ServiceCommandProvider::new(settings.commands.default.clone())
            .with_overrides(settings.commands.overrides.clone())
            .with_backend(backend, settings.registry.command_root.clone());

        let config = InvokerConfig::builder()
            .result_cache_ttl(settings.invoker.result_cache_ttl())
            .result_cache_capacity(settings.invoker.result_cache_capacity)
            .replication_factor(settings.ring.replication_factor)
            .build();

        let invoker = RemoteInvoker::builder(routes.clone(), health.clone(), transport)
            .config(config)
            .commands(commands)
            .build();

        Self {
            settings,
            services: Arc::new(ServiceEntryRegistry::new()),
            routes,
            health,
            invoker,
        }
    }

    /// Load the routes, follow them with the health monitor and start probing.
    pub async fn start(&self) -> Result<()> {
        self.routes.start().await?;
        self.health.attach(&self.routes);
        self.health.start();
        info!(route_root = %self.settings.registry.route_root, "Trellis node started");
        Ok(())
    }

    /// Publish every networked local service as hosted on `endpoint`.
    pub async fn publish(&self, endpoint: &EndpointAddress) -> Result<()> {
        let routes = self.services.routes(endpoint);
        let count = routes.len();
        self.routes.set_routes(routes).await?;
        info!(endpoint = %endpoint, services = count, "Published local services");
        Ok(())
    }

    /// Remove `endpoint` from every route.
    pub async fn withdraw(&self, endpoint: &EndpointAddress) -> Result<()> {
        self.routes.remove_addresses(std::slice::from_ref(endpoint)).await
    }

    pub fn settings(&self) -> &TrellisSettings {
        &self.settings
    }

    pub fn services(&self) -> &Arc<ServiceEntryRegistry> {
        &self.services
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn invoker(&self) -> &Arc<RemoteInvoker> {
        &self.invoker
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(self.invoker.clone())
    }

    /// Stop the background loops.
    pub async fn shutdown(&self) {
        self.health.shutdown().await;
        self.routes.shutdown().await;
        info!("Trellis node stopped");
    }
}
