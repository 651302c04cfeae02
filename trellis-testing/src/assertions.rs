// Assertions for invocation outcomes and node state

use trellis_core::EndpointAddress;
use trellis_core::resilience::CircuitState;
use trellis_discovery::RouteTable;
use trellis_rpc::{ErrorKind, RemoteInvoker, RpcError};

/// Assert that a call failed with a specific kind of error
pub fn assert_error_kind<T: std::fmt::Debug>(result: &Result<T, RpcError>, expected: ErrorKind) {
    match result {
        Err(err) => assert_eq!(err.kind(), expected, "Expected {:?} error, got {}", expected, err),
        Ok(value) => panic!("Expected {:?} error, got Ok({:?})", expected, value),
    }
}

/// Assert the state of a service's circuit breaker
pub fn assert_breaker_state(invoker: &RemoteInvoker, service_id: &str, expected: CircuitState) {
    let actual = invoker
        .circuit_breaker(service_id)
        .map(|b| b.state())
        .unwrap_or(CircuitState::Closed);
    assert_eq!(
        actual, expected,
        "Expected breaker of '{}' to be {}, got {}",
        service_id, expected, actual
    );
}

/// Assert the endpoints a route lists, in order
pub fn assert_route(routes: &RouteTable, service_id: &str, expected: &[EndpointAddress]) {
    let actual = routes
        .get_route(service_id)
        .map(|r| r.addresses().to_vec())
        .unwrap_or_default();
    assert_eq!(
        actual, expected,
        "Expected route '{}' to list {:?}, got {:?}",
        service_id, expected, actual
    );
}

/// Assert that no route exists for a service
pub fn assert_no_route(routes: &RouteTable, service_id: &str) {
    assert!(
        routes.get_route(service_id).is_none(),
        "Expected no route for '{}'",
        service_id
    );
}
