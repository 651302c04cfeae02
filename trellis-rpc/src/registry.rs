//! Server side: typed service handlers and in-process dispatch.
//!
//! A [`ServiceEntryRegistry`] maps service ids to async handlers registered
//! up front. It produces the routes a node publishes and dispatches incoming
//! [`InvokeMessage`]s. Parameters are decoded from the message's parameter
//! map into the handler's input type, and the handler's output is encoded
//! back into the [`InvokeResult`].
//!
//! ```rust,ignore
//! #[derive(Deserialize)]
//! struct GetUser { id: u64 }
//!
//! let registry = ServiceEntryRegistry::new();
//! registry.register(ServiceDescriptor::new("user.get"), |p: GetUser| async move {
//!     Ok::<_, RemoteFault>(json!({ "id": p.id }))
//! });
//! ```

use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use trellis_core::{EndpointAddress, InvokeMessage, InvokeResult, RemoteFault, ServiceDescriptor, ServiceRoute};

/// Error code for an unknown service id.
pub const CODE_NOT_FOUND: i32 = 404;
/// Error code for parameters that do not match the handler's input.
pub const CODE_BAD_PARAMETERS: i32 = 400;
/// Error code for results that cannot be encoded.
pub const CODE_INTERNAL: i32 = 500;

type Handler = Arc<dyn Fn(InvokeMessage) -> BoxFuture<'static, InvokeResult> + Send + Sync>;

struct ServiceEntry {
    descriptor: ServiceDescriptor,
    handler: Handler,
}

/// Service handlers hosted by one node.
#[derive(Default)]
pub struct ServiceEntryRegistry {
    entries: DashMap<String, ServiceEntry>,
}

impl ServiceEntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler. Replaces any handler with the same id.
    pub fn register<P, R, F, Fut>(&self, descriptor: ServiceDescriptor, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RemoteFault>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let service_id = descriptor.id.clone();

        let erased: Handler = Arc::new(move |message: InvokeMessage| -> BoxFuture<'static, InvokeResult> {
            let handler = handler.clone();
            Box::pin(async move {
                let parameters = Value::Object(message.parameters.into_iter().collect());
                let params: P = match serde_json::from_value(parameters) {
                    Ok(params) => params,
                    Err(err) => {
                        return InvokeResult::error(CODE_BAD_PARAMETERS, format!("invalid parameters: {}", err));
                    }
                };

                match handler(params).await {
                    Ok(output) => match serde_json::to_value(output) {
                        Ok(value) => InvokeResult::Ok(value),
                        Err(err) => InvokeResult::error(CODE_INTERNAL, format!("unencodable result: {}", err)),
                    },
                    Err(fault) => InvokeResult::Err(fault),
                }
            })
        });

        debug!(service_id = %service_id, "Registered service handler");
        self.entries.insert(
            service_id,
            ServiceEntry {
                descriptor,
                handler: erased,
            },
        );
    }

    pub fn unregister(&self, service_id: &str) -> bool {
        self.entries.remove(service_id).is_some()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.entries.contains_key(service_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors of every registered service, sorted by id
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        let mut descriptors: Vec<ServiceDescriptor> =
            self.entries.iter().map(|e| e.descriptor.clone()).collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    /// Routes this node publishes when it listens on `endpoint`.
    /// Services flagged `disable_network` stay local.
    pub fn routes(&self, endpoint: &EndpointAddress) -> Vec<ServiceRoute> {
        self.descriptors()
            .into_iter()
            .filter(|d| !d.disable_network())
            .map(|d| ServiceRoute::new(d, [endpoint.clone()]))
            .collect()
    }

    /// Run the handler for `message`.
    pub async fn dispatch(&self, message: InvokeMessage) -> InvokeResult {
        let handler = match self.entries.get(&message.service_id) {
            Some(entry) => entry.handler.clone(),
            None => {
                warn!(service_id = %message.service_id, "No handler registered");
                return InvokeResult::error(CODE_NOT_FOUND, format!("unknown service: {}", message.service_id));
            }
        };
        handler(message).await
    }
}

/// Transport that hands envelopes to in-process registries by endpoint.
#[derive(Default)]
pub struct LocalTransport {
    nodes: DashMap<EndpointAddress, Arc<ServiceEntryRegistry>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `registry` at `endpoint`.
    pub fn bind(&self, endpoint: EndpointAddress, registry: Arc<ServiceEntryRegistry>) {
        self.nodes.insert(endpoint, registry);
    }

    /// Stop serving at `endpoint`; calls to it fail with a connection error.
    pub fn unbind(&self, endpoint: &EndpointAddress) -> bool {
        self.nodes.remove(endpoint).is_some()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn invoke(
        &self,
        endpoint: &EndpointAddress,
        message: &InvokeMessage,
        _timeout: Duration,
    ) -> Result<InvokeResult, TransportError> {
        let registry = self
            .nodes
            .get(endpoint)
            .map(|r| r.clone())
            .ok_or_else(|| TransportError::Connection(format!("connection refused: {}", endpoint)))?;
        Ok(registry.dispatch(message.clone()).await)
    }
}
