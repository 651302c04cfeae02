// Scriptable transport and health probe

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use trellis_core::{EndpointAddress, InvokeMessage, InvokeResult};
use trellis_discovery::HealthProbe;
use trellis_rpc::{Transport, TransportError};

/// How a mocked endpoint answers.
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Answer with a value.
    Reply(Value),
    /// Answer with an application error.
    Fault { code: i32, message: String },
    /// Fail delivery.
    Fail(TransportError),
    /// Never answer within any sensible timeout.
    Hang,
}

impl Behavior {
    /// Refuse connections.
    pub fn refuse() -> Self {
        Self::Fail(TransportError::Connection("connection refused".to_string()))
    }

    pub fn fault(code: i32, message: impl Into<String>) -> Self {
        Self::Fault {
            code,
            message: message.into(),
        }
    }
}

/// One call seen by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub endpoint: EndpointAddress,
    pub service_id: String,
}

#[derive(Default)]
struct Script {
    queued: HashMap<EndpointAddress, Vec<Behavior>>,
    sticky: HashMap<EndpointAddress, Behavior>,
    delay: Option<Duration>,
}

/// Transport whose answers are scripted per endpoint.
///
/// Queued behaviors are consumed first, then the endpoint's sticky
/// behavior applies. Endpoints without either reply with
/// `{"endpoint": "host:port"}`.
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<Script>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `endpoint` with `behavior`.
    pub fn set(&self, endpoint: &EndpointAddress, behavior: Behavior) -> &Self {
        self.script.lock().sticky.insert(endpoint.clone(), behavior);
        self
    }

    /// Answer the next call to `endpoint` with `behavior`.
    pub fn enqueue(&self, endpoint: &EndpointAddress, behavior: Behavior) -> &Self {
        self.script
            .lock()
            .queued
            .entry(endpoint.clone())
            .or_default()
            .push(behavior);
        self
    }

    /// Refuse connections on every listed endpoint.
    pub fn take_down(&self, endpoints: &[EndpointAddress]) {
        for endpoint in endpoints {
            self.set(endpoint, Behavior::refuse());
        }
    }

    /// Drop the scripted behavior of `endpoint`.
    pub fn restore(&self, endpoint: &EndpointAddress) {
        let mut script = self.script.lock();
        script.sticky.remove(endpoint);
        script.queued.remove(endpoint);
    }

    /// Delay every answer.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.script.lock().delay = delay;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls that reached `endpoint`
    pub fn calls_to(&self, endpoint: &EndpointAddress) -> usize {
        self.calls.lock().iter().filter(|c| &c.endpoint == endpoint).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn next_behavior(&self, endpoint: &EndpointAddress) -> (Option<Behavior>, Option<Duration>) {
        let mut script = self.script.lock();
        let queued = script.queued.get_mut(endpoint).and_then(|q| (!q.is_empty()).then(|| q.remove(0)));
        let behavior = queued.or_else(|| script.sticky.get(endpoint).cloned());
        (behavior, script.delay)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke(
        &self,
        endpoint: &EndpointAddress,
        message: &InvokeMessage,
        timeout: Duration,
    ) -> Result<InvokeResult, TransportError> {
        self.calls.lock().push(RecordedCall {
            endpoint: endpoint.clone(),
            service_id: message.service_id.clone(),
        });

        let (behavior, delay) = self.next_behavior(endpoint);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match behavior {
            None => Ok(InvokeResult::ok(json!({ "endpoint": endpoint.key() }))),
            Some(Behavior::Reply(value)) => Ok(InvokeResult::Ok(value)),
            Some(Behavior::Fault { code, message }) => Ok(InvokeResult::error(code, message)),
            Some(Behavior::Fail(err)) => Err(err),
            Some(Behavior::Hang) => {
                tokio::time::sleep(timeout * 10).await;
                Err(TransportError::Closed("hung call abandoned".to_string()))
            }
        }
    }
}

/// Health probe with scripted results.
///
/// Endpoints are healthy unless marked down.
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    health: Arc<Mutex<HashMap<EndpointAddress, bool>>>,
    probes: Arc<Mutex<HashMap<EndpointAddress, u64>>>,
    total: Arc<AtomicU64>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, endpoint: &EndpointAddress, healthy: bool) {
        self.health.lock().insert(endpoint.clone(), healthy);
    }

    /// Times `endpoint` was probed
    pub fn probe_count(&self, endpoint: &EndpointAddress) -> u64 {
        self.probes.lock().get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_probes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, endpoint: &EndpointAddress) -> bool {
        *self.probes.lock().entry(endpoint.clone()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        self.health.lock().get(endpoint).copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(n: u8) -> EndpointAddress {
        EndpointAddress::new(format!("10.0.0.{}", n), 80)
    }

    #[tokio::test]
    async fn test_mock_transport_defaults_to_reply() {
        let transport = MockTransport::new();
        let result = transport
            .invoke(&endpoint(1), &InvokeMessage::new("svc"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result, InvokeResult::ok(json!({ "endpoint": "10.0.0.1:80" })));
        assert_eq!(transport.calls_to(&endpoint(1)), 1);
        assert_eq!(transport.calls()[0].service_id, "svc");
    }

    #[tokio::test]
    async fn test_queued_before_sticky() {
        let transport = MockTransport::new();
        transport
            .set(&endpoint(1), Behavior::fault(500, "boom"))
            .enqueue(&endpoint(1), Behavior::refuse());
        let message = InvokeMessage::new("svc");
        let timeout = Duration::from_secs(1);

        assert!(transport.invoke(&endpoint(1), &message, timeout).await.is_err());
        let second = transport.invoke(&endpoint(1), &message, timeout).await.unwrap();
        assert!(!second.is_ok());

        transport.restore(&endpoint(1));
        assert!(transport.invoke(&endpoint(1), &message, timeout).await.unwrap().is_ok());
        assert_eq!(transport.call_count(), 3);
    }

    #[test]
    fn test_scripted_probe() {
        let probe = ScriptedProbe::new();
        probe.set_healthy(&endpoint(2), false);

        assert!(tokio_test::block_on(probe.probe(&endpoint(1))));
        assert!(!tokio_test::block_on(probe.probe(&endpoint(2))));
        assert_eq!(probe.probe_count(&endpoint(2)), 1);
        assert_eq!(probe.total_probes(), 2);
    }
}
