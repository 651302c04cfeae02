//! Operational snapshot of routes, endpoint health and breakers.

use crate::invoker::RemoteInvoker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use trellis_core::resilience::{BulkheadStats, CircuitBreakerStats};
use trellis_discovery::EndpointHealth;

/// Serializable view of one node's routing state.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Service id → canonical endpoint strings.
    pub routes: BTreeMap<String, Vec<String>>,
    /// Health of every tracked endpoint.
    pub endpoints: Vec<EndpointHealth>,
    /// Breaker state per called service.
    pub breakers: Vec<CircuitBreakerStats>,
    /// Concurrency gate usage per called service.
    pub bulkheads: Vec<BulkheadStats>,
}

impl DiagnosticsSnapshot {
    /// Number of endpoints currently considered healthy.
    pub fn healthy_endpoints(&self) -> usize {
        self.endpoints.iter().filter(|e| e.healthy).count()
    }
}

/// Collects [`DiagnosticsSnapshot`]s from an invoker and the components it uses.
#[derive(Clone)]
pub struct Diagnostics {
    invoker: Arc<RemoteInvoker>,
}

impl Diagnostics {
    pub fn new(invoker: Arc<RemoteInvoker>) -> Self {
        Self { invoker }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let routes = self
            .invoker
            .routes()
            .get_routes()
            .into_iter()
            .map(|route| {
                let endpoints = route.addresses().iter().map(|a| a.key()).collect();
                (route.service_id().to_string(), endpoints)
            })
            .collect();

        DiagnosticsSnapshot {
            routes,
            endpoints: self.invoker.health().snapshot(),
            breakers: self.invoker.breaker_stats(),
            bulkheads: self.invoker.bulkhead_stats(),
        }
    }

    /// Snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}
