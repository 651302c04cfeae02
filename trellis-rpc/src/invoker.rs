//! The invocation pipeline.

use crate::cache::ResultCache;
use crate::command::ServiceCommandProvider;
use crate::config::InvokerConfig;
use crate::error::{Result, RpcError};
use crate::fallback::FallbackRegistry;
use crate::transport::Transport;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use trellis_core::resilience::{
    Bulkhead, BulkheadConfig, BulkheadStats, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats,
    CircuitState, Timeout, TimeoutError,
};
use trellis_core::{
    EndpointAddress, FailoverStrategy, InvokeMessage, InvokeResult, SelectionContext, SelectorSet, ServiceCommand,
};
use trellis_discovery::{HealthMonitor, RouteTable};

/// Caller-supplied part of a call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvokeRequest {
    /// Routing key for hash selection and result caching.
    pub service_key: Option<String>,
    /// Named parameters.
    pub parameters: BTreeMap<String, Value>,
    /// Out-of-band context.
    pub attachments: BTreeMap<String, String>,
}

impl InvokeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request whose parameters are the fields of `params`.
    pub fn from_params<T: Serialize>(params: &T) -> Result<Self> {
        match serde_json::to_value(params) {
            Ok(Value::Object(map)) => Ok(Self {
                parameters: map.into_iter().collect(),
                ..Default::default()
            }),
            Ok(other) => Err(RpcError::Decode(format!("parameters must be an object, got {}", other))),
            Err(err) => Err(RpcError::Decode(err.to_string())),
        }
    }

    /// Set the routing key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.service_key = Some(key.into());
        self
    }

    /// Add a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Add an attachment.
    pub fn attachment(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(name.into(), value.into());
        self
    }

    fn into_message(self, service_id: &str) -> InvokeMessage {
        InvokeMessage {
            service_id: service_id.to_string(),
            service_key: self.service_key,
            parameters: self.parameters,
            attachments: self.attachments,
        }
    }
}

/// Executes calls against remote services.
///
/// One call runs through: command lookup, optional result cache, the
/// per-service concurrency gate, breaker admission, route resolution,
/// health filtering, endpoint selection and up to `failover_cluster`
/// attempts, each under `execution_timeout`.
pub struct RemoteInvoker {
    config: InvokerConfig,
    routes: Arc<RouteTable>,
    health: Arc<HealthMonitor>,
    transport: Arc<dyn Transport>,
    commands: Arc<ServiceCommandProvider>,
    selectors: SelectorSet,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    bulkheads: DashMap<String, Arc<Bulkhead>>,
    cache: ResultCache,
    fallbacks: FallbackRegistry,
}

/// Builder for [`RemoteInvoker`].
pub struct RemoteInvokerBuilder {
    routes: Arc<RouteTable>,
    health: Arc<HealthMonitor>,
    transport: Arc<dyn Transport>,
    config: InvokerConfig,
    commands: Option<Arc<ServiceCommandProvider>>,
}

impl RemoteInvokerBuilder {
    /// Set the invoker configuration.
    pub fn config(mut self, config: InvokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the command provider.
    pub fn commands(mut self, commands: ServiceCommandProvider) -> Self {
        self.commands = Some(Arc::new(commands));
        self
    }

    /// Build the invoker.
    pub fn build(self) -> Arc<RemoteInvoker> {
        let cache = ResultCache::new(self.config.result_cache_capacity, self.config.result_cache_ttl);
        Arc::new(RemoteInvoker {
            selectors: SelectorSet::new(self.config.replication_factor),
            config: self.config,
            routes: self.routes,
            health: self.health,
            transport: self.transport,
            commands: self.commands.unwrap_or_default(),
            breakers: DashMap::new(),
            bulkheads: DashMap::new(),
            cache,
            fallbacks: FallbackRegistry::new(),
        })
    }
}

impl RemoteInvoker {
    /// Start building an invoker over a route table, a health monitor and a transport.
    pub fn builder(
        routes: Arc<RouteTable>,
        health: Arc<HealthMonitor>,
        transport: Arc<dyn Transport>,
    ) -> RemoteInvokerBuilder {
        RemoteInvokerBuilder {
            routes,
            health,
            transport,
            config: InvokerConfig::default(),
            commands: None,
        }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn commands(&self) -> &ServiceCommandProvider {
        &self.commands
    }

    pub fn selectors(&self) -> &SelectorSet {
        &self.selectors
    }

    pub fn fallbacks(&self) -> &FallbackRegistry {
        &self.fallbacks
    }

    pub fn result_cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Call a service and decode its result.
    pub async fn invoke_as<T: DeserializeOwned>(&self, service_id: &str, request: InvokeRequest) -> Result<T> {
        let value = self.invoke(service_id, request).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
    }

    /// Call a service.
    pub async fn invoke(&self, service_id: &str, request: InvokeRequest) -> Result<Value> {
        let command = self.commands.command(service_id).await;
        let message = request.into_message(service_id);

        let cache_key = command.request_cache_enabled.then(|| ResultCache::key(&message));
        if let Some(key) = &cache_key
            && let Some(value) = self.cache.get(key)
        {
            debug!(service_id, "Serving cached result");
            return Ok(value);
        }

        match self.execute(&message, &command).await {
            Ok(value) => {
                if let Some(key) = cache_key {
                    self.cache.insert(key, value.clone());
                }
                Ok(value)
            }
            Err(err) if command.fallback_enabled => match self.fallbacks.get(service_id) {
                Some(fallback) => fallback.recover(message, err).await,
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    async fn execute(&self, message: &InvokeMessage, command: &ServiceCommand) -> Result<Value> {
        let service_id = message.service_id.as_str();

        let bulkhead = self.bulkhead(service_id, command);
        let Some(_permit) = bulkhead.try_acquire() else {
            warn!(service_id, limit = command.max_concurrent_requests, "Concurrency limit reached");
            return Err(RpcError::CapacityExceeded(service_id.to_string()));
        };

        let breaker = self.breaker(service_id, command);
        // Dropping the permit unsettled (no attempt, or this future cancelled)
        // frees a Half-Open probe slot.
        let Some(mut admission) = breaker.try_acquire() else {
            return Err(RpcError::CircuitOpen(service_id.to_string()));
        };

        let max_attempts = command.max_attempts();
        let timeout = Timeout::new(service_id, command.timeout());
        let mut tried: Vec<EndpointAddress> = Vec::new();
        let mut last_error: Option<RpcError> = None;

        loop {
            let endpoint = match self.select_endpoint(message, command, &tried).await {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    return Err(match last_error {
                        Some(last) => {
                            info!(service_id, attempts = tried.len(), "No alternate endpoint left for failover");
                            exhausted(tried.len() as u32, last)
                        }
                        None => err,
                    });
                }
            };

            tried.push(endpoint.clone());
            let attempt = tried.len() as u32;
            debug!(service_id, endpoint = %endpoint, attempt, "Attempting call");

            let outcome = timeout
                .call(|| self.transport.invoke(&endpoint, message, command.timeout()))
                .await;

            let err = match outcome {
                Ok(InvokeResult::Ok(value)) => {
                    admission.record_success();
                    return Ok(value);
                }
                Ok(InvokeResult::Err(fault)) => {
                    // The endpoint answered; this is the service's verdict
                    admission.record_success();
                    return Err(RpcError::Remote {
                        code: fault.code,
                        message: fault.message,
                    });
                }
                Err(TimeoutError::Elapsed(elapsed)) => RpcError::Timeout(elapsed),
                Err(TimeoutError::Execution(err)) => RpcError::Transport(err),
            };

            warn!(service_id, endpoint = %endpoint, attempt, error = %err, "Call attempt failed");
            self.health.mark_failure(&endpoint);
            admission.record_failure();

            let retry = command.strategy == FailoverStrategy::Failover
                && attempt < max_attempts
                && breaker.state() == CircuitState::Closed;
            if !retry {
                return Err(exhausted(attempt, err));
            }
            last_error = Some(err);
        }
    }

    async fn select_endpoint(
        &self,
        message: &InvokeMessage,
        command: &ServiceCommand,
        tried: &[EndpointAddress],
    ) -> Result<EndpointAddress> {
        let service_id = message.service_id.as_str();
        let route = self
            .routes
            .get_route(service_id)
            .ok_or_else(|| RpcError::NoRoute(service_id.to_string()))?;

        let mut live = Vec::with_capacity(route.addresses().len());
        for address in route.addresses() {
            if self.health.is_healthy(address).await {
                live.push(address.clone());
            }
        }

        let selector = self.selectors.get(command.shunt_strategy);
        let context = SelectionContext::new(service_id, message.routing_key(), &live)
            .members(route.addresses())
            .excluding(tried);
        selector
            .select(&context)
            .ok_or_else(|| RpcError::NoLiveEndpoint(service_id.to_string()))
    }

    fn breaker(&self, service_id: &str, command: &ServiceCommand) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(CircuitBreakerConfig::from_command(service_id, command)))
            .clone()
    }

    fn bulkhead(&self, service_id: &str, command: &ServiceCommand) -> Arc<Bulkhead> {
        self.bulkheads
            .entry(service_id.to_string())
            .or_insert_with(|| Bulkhead::new(BulkheadConfig::new(service_id, command.max_concurrent_requests)))
            .clone()
    }

    /// Breaker of a service, once it has been called.
    pub fn circuit_breaker(&self, service_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service_id).map(|b| b.clone())
    }

    /// Breaker statistics of every called service, sorted by service id.
    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Concurrency gate statistics of every called service, sorted by service id.
    pub fn bulkhead_stats(&self) -> Vec<BulkheadStats> {
        let mut stats: Vec<BulkheadStats> = self.bulkheads.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

fn exhausted(attempts: u32, last: RpcError) -> RpcError {
    if attempts > 1 {
        RpcError::RetryExhausted {
            attempts,
            last: Box::new(last),
        }
    } else {
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::Fallback;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use trellis_core::{ServiceDescriptor, ServiceRoute};
    use trellis_discovery::{HealthMonitorConfig, HealthProbe, InMemoryBackend, RouteTableConfig};

    struct Probe(bool);

    #[async_trait]
    impl HealthProbe for Probe {
        async fn probe(&self, _endpoint: &EndpointAddress) -> bool {
            self.0
        }
    }

    /// Answers `{"served_by": host:port}` unless the endpoint is down.
    #[derive(Default)]
    struct Scripted {
        down: Mutex<HashSet<EndpointAddress>>,
        fault: Mutex<Option<(i32, String)>>,
        delay: Mutex<Option<Duration>>,
        calls: Mutex<Vec<EndpointAddress>>,
    }

    impl Scripted {
        fn take_down(&self, endpoints: &[EndpointAddress]) {
            self.down.lock().extend(endpoints.iter().cloned());
        }

        fn calls(&self) -> Vec<EndpointAddress> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn invoke(
            &self,
            endpoint: &EndpointAddress,
            _message: &InvokeMessage,
            _timeout: Duration,
        ) -> std::result::Result<InvokeResult, TransportError> {
            self.calls.lock().push(endpoint.clone());
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.down.lock().contains(endpoint) {
                return Err(TransportError::Connection(format!("refused: {}", endpoint)));
            }
            if let Some((code, message)) = self.fault.lock().clone() {
                return Ok(InvokeResult::error(code, message));
            }
            Ok(InvokeResult::ok(json!({ "served_by": endpoint.key() })))
        }
    }

    fn endpoints() -> Vec<EndpointAddress> {
        vec![
            EndpointAddress::new("10.0.0.1", 80),
            EndpointAddress::new("10.0.0.2", 80),
            EndpointAddress::new("10.0.0.3", 80),
        ]
    }

    async fn setup(command: ServiceCommand, healthy: bool) -> (Arc<RemoteInvoker>, Arc<Scripted>) {
        let routes = RouteTable::new(Arc::new(InMemoryBackend::new()), RouteTableConfig::new("/routes"));
        routes
            .set_routes(vec![ServiceRoute::new(ServiceDescriptor::new("order.create"), endpoints())])
            .await
            .unwrap();
        let health = HealthMonitor::new(HealthMonitorConfig::default(), Arc::new(Probe(healthy)));
        let transport = Arc::new(Scripted::default());
        let invoker = RemoteInvoker::builder(routes, health, transport.clone())
            .commands(ServiceCommandProvider::new(command))
            .build();
        (invoker, transport)
    }

    fn distinct(calls: &[EndpointAddress]) -> usize {
        calls.iter().collect::<HashSet<_>>().len()
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let (invoker, transport) = setup(ServiceCommand::new(), true).await;

        let value = invoker.invoke("order.create", InvokeRequest::new().key("o-1")).await.unwrap();

        assert!(value["served_by"].as_str().unwrap().starts_with("10.0.0."));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(invoker.breaker_stats()[0].total_successes, 1);
    }

    #[tokio::test]
    async fn test_failover_moves_to_untried_endpoints() {
        let (invoker, transport) = setup(ServiceCommand::new().failover_cluster(3), true).await;
        let all = endpoints();
        transport.take_down(&all[..2]);

        let value = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap();

        let calls = transport.calls();
        assert_eq!(value["served_by"], json!("10.0.0.3:80"));
        assert_eq!(calls.last(), Some(&all[2]));
        assert_eq!(calls.len(), distinct(&calls));
        for failed in &calls[..calls.len() - 1] {
            assert!(!invoker.health().is_healthy(failed).await);
        }
    }

    #[tokio::test]
    async fn test_failover_exhaustion() {
        let (invoker, transport) = setup(ServiceCommand::new().failover_cluster(3), true).await;
        transport.take_down(&endpoints());

        let err = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap_err();

        match err {
            RpcError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, RpcError::Transport(TransportError::Connection(_))));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(distinct(&transport.calls()), 3);
    }

    #[tokio::test]
    async fn test_fail_fast_makes_one_attempt() {
        let command = ServiceCommand::new().strategy(FailoverStrategy::FailFast);
        let (invoker, transport) = setup(command, true).await;
        transport.take_down(&endpoints());

        let err = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap_err();

        assert!(matches!(err, RpcError::Transport(_)));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_error_is_not_retried() {
        let (invoker, transport) = setup(ServiceCommand::new(), true).await;
        *transport.fault.lock() = Some((409, "duplicate order".to_string()));

        let err = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap_err();

        assert_eq!(err.remote_code(), Some(409));
        assert_eq!(transport.calls().len(), 1);
        let stats = invoker.circuit_breaker("order.create").unwrap().stats();
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.total_successes, 1);
    }

    #[tokio::test]
    async fn test_no_route() {
        let (invoker, transport) = setup(ServiceCommand::new(), true).await;

        let err = invoker.invoke("order.cancel", InvokeRequest::new()).await.unwrap_err();

        assert!(matches!(err, RpcError::NoRoute(id) if id == "order.cancel"));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_live_endpoint() {
        let (invoker, transport) = setup(ServiceCommand::new(), false).await;

        let err = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap_err();

        assert!(matches!(err, RpcError::NoLiveEndpoint(_)));
        assert!(transport.calls().is_empty());
        let stats = invoker.circuit_breaker("order.create").unwrap().stats();
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test]
    async fn test_concurrency_gate_rejects_excess_calls() {
        let (invoker, transport) = setup(ServiceCommand::new().max_concurrent_requests(1), true).await;
        *transport.delay.lock() = Some(Duration::from_millis(100));

        let (first, second) = tokio::join!(invoker.invoke("order.create", InvokeRequest::new()), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            invoker.invoke("order.create", InvokeRequest::new()).await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(RpcError::CapacityExceeded(_))));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(invoker.bulkhead_stats()[0].name, "order.create");
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let command = ServiceCommand::new()
            .strategy(FailoverStrategy::FailFast)
            .request_volume_threshold(2)
            .error_threshold_percentage(50);
        let (invoker, transport) = setup(command, true).await;
        transport.take_down(&endpoints());

        for _ in 0..2 {
            assert!(invoker.invoke("order.create", InvokeRequest::new()).await.is_err());
        }
        let err = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap_err();

        assert!(matches!(err, RpcError::CircuitOpen(_)));
        assert_eq!(transport.calls().len(), 2);
        assert_eq!(invoker.breaker_stats()[0].state, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_call_frees_slot() {
        let command = ServiceCommand::new()
            .strategy(FailoverStrategy::FailFast)
            .request_volume_threshold(1)
            .error_threshold_percentage(50)
            .sleep_window(Duration::from_secs(5));
        let (invoker, transport) = setup(command, true).await;
        transport.take_down(&endpoints());
        assert!(invoker.invoke("order.create", InvokeRequest::new()).await.is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        transport.down.lock().clear();
        invoker.health().probe_all().await;
        *transport.delay.lock() = Some(Duration::from_secs(3600));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            invoker.invoke("order.create", InvokeRequest::new()),
        )
        .await;
        assert!(cancelled.is_err());

        *transport.delay.lock() = None;
        let value = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap();

        assert!(value["served_by"].is_string());
        assert_eq!(invoker.breaker_stats()[0].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_fallback_replaces_transport_failure() {
        let command = ServiceCommand::new().fallback(true);
        let (invoker, transport) = setup(command, true).await;
        invoker.fallbacks().register("order.create", Fallback::value(json!({ "queued": true })));
        transport.take_down(&endpoints());

        let value = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap();

        assert_eq!(value, json!({ "queued": true }));
    }

    #[tokio::test]
    async fn test_fallback_does_not_mask_remote_errors() {
        let (invoker, transport) = setup(ServiceCommand::new().fallback(true), true).await;
        invoker.fallbacks().register("order.create", Fallback::value(json!(null)));
        *transport.fault.lock() = Some((400, "bad input".to_string()));

        let err = invoker.invoke("order.create", InvokeRequest::new()).await.unwrap_err();

        assert!(matches!(err, RpcError::Remote { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_result_cache_serves_repeated_calls() {
        let (invoker, transport) = setup(ServiceCommand::new().request_cache(true), true).await;
        let request = InvokeRequest::new().key("o-7").param("qty", 2);

        let first = invoker.invoke("order.create", request.clone()).await.unwrap();
        let second = invoker.invoke("order.create", request).await.unwrap();
        let other = invoker
            .invoke("order.create", InvokeRequest::new().key("o-7").param("qty", 3))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert!(other.is_object());
        assert_eq!(transport.calls().len(), 2);
        assert_eq!(invoker.result_cache().len(), 2);
    }

    #[tokio::test]
    async fn test_invoke_as_decodes_result() {
        #[derive(serde::Deserialize)]
        struct Served {
            served_by: String,
        }

        let (invoker, _transport) = setup(ServiceCommand::new(), true).await;
        let served: Served = invoker.invoke_as("order.create", InvokeRequest::new()).await.unwrap();
        assert!(served.served_by.ends_with(":80"));

        let err = invoker.invoke_as::<u32>("order.create", InvokeRequest::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[test]
    fn test_request_from_params() {
        #[derive(Serialize)]
        struct Create {
            sku: &'static str,
            qty: u32,
        }

        let request = InvokeRequest::from_params(&Create { sku: "A-1", qty: 2 }).unwrap();
        assert_eq!(request.parameters["qty"], json!(2));
        assert!(InvokeRequest::from_params(&5).is_err());
    }
}
