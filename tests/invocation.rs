//! End-to-end tests of the invocation pipeline.

use std::time::Duration;
use trellis::prelude::*;
use trellis_rpc::ErrorKind;
use trellis_testing::*;

fn failfast_breaker(sleep_window: Duration) -> ServiceCommand {
    ServiceCommand::new()
        .strategy(FailoverStrategy::FailFast)
        .request_volume_threshold(10)
        .error_threshold_percentage(50)
        .sleep_window(sleep_window)
}

#[tokio::test]
async fn test_breaker_opens_fails_fast_and_recovers() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1)])
        .with_default_command(failfast_breaker(Duration::from_millis(200)))
        .build()
        .await;
    for _ in 0..6 {
        cluster.transport.enqueue(&node(1), Behavior::refuse());
    }

    // 6 failures and 4 successes: the tenth call trips the breaker
    for i in 0..10 {
        let result = cluster.invoke("order.create", InvokeRequest::new()).await;
        if i < 6 {
            assert_error_kind(&result, ErrorKind::Transport);
            // Failed calls mark the endpoint down until the next probe
            cluster.health.probe_all().await;
        } else {
            assert!(result.is_ok());
        }
    }
    assert_breaker_state(&cluster.invoker, "order.create", CircuitState::Open);

    let result = cluster.invoke("order.create", InvokeRequest::new()).await;
    assert_error_kind(&result, ErrorKind::CircuitOpen);
    assert_eq!(cluster.transport.call_count(), 10);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(cluster.invoke("order.create", InvokeRequest::new()).await.is_ok());
    assert_breaker_state(&cluster.invoker, "order.create", CircuitState::Closed);

    let stats = cluster.invoker.circuit_breaker("order.create").unwrap().stats();
    assert_eq!(stats.window_requests, 0);
    assert_eq!(stats.total_rejections, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_half_open_probe_reopens() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1), node(2)])
        .with_default_command(
            failfast_breaker(Duration::from_millis(100)).request_volume_threshold(2),
        )
        .build()
        .await;
    cluster.transport.take_down(&[node(1), node(2)]);

    for _ in 0..2 {
        assert!(cluster.invoke("order.create", InvokeRequest::new()).await.is_err());
    }
    assert_breaker_state(&cluster.invoker, "order.create", CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;
    cluster.health.probe_all().await;
    let result = cluster.invoke("order.create", InvokeRequest::new()).await;
    assert_error_kind(&result, ErrorKind::Transport);
    assert_breaker_state(&cluster.invoker, "order.create", CircuitState::Open);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failover_reaches_the_healthy_endpoint() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1), node(2), node(3)])
        .with_default_command(ServiceCommand::new().failover_cluster(3))
        .build()
        .await;
    cluster.transport.take_down(&[node(1), node(2)]);

    let reply = cluster.invoke("order.create", InvokeRequest::new().key("o-1")).await.unwrap();

    assert_eq!(reply["endpoint"], "10.0.0.3:80");
    assert_eq!(cluster.transport.calls_to(&node(3)), 1);
    for failed in [node(1), node(2)] {
        if cluster.transport.calls_to(&failed) > 0 {
            assert!(!cluster.health.is_healthy(&failed).await);
        }
    }
    assert!(cluster.transport.calls_to(&node(1)) <= 1);
    assert!(cluster.transport.calls_to(&node(2)) <= 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failover_exhausts_every_candidate() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1), node(2), node(3)])
        .build()
        .await;
    cluster.transport.take_down(&[node(1), node(2), node(3)]);

    let result = cluster.invoke("order.create", InvokeRequest::new()).await;

    assert_error_kind(&result, ErrorKind::RetryExhausted);
    assert_eq!(cluster.transport.call_count(), 3);

    // Every endpoint is now marked down
    let result = cluster.invoke("order.create", InvokeRequest::new()).await;
    assert_error_kind(&result, ErrorKind::NoLiveEndpoint);
    assert_eq!(cluster.transport.call_count(), 3);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_gate() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1)])
        .with_default_command(ServiceCommand::new().max_concurrent_requests(1))
        .build()
        .await;
    cluster.transport.set_delay(Some(Duration::from_millis(100)));

    let (first, second) = tokio::join!(cluster.invoke("order.create", InvokeRequest::new()), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster.invoke("order.create", InvokeRequest::new()).await
    });

    assert!(first.is_ok());
    assert_error_kind(&second, ErrorKind::CapacityExceeded);
    assert_eq!(cluster.transport.call_count(), 1);

    // The permit is released once the call finishes
    assert!(cluster.invoke("order.create", InvokeRequest::new()).await.is_ok());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1), node(2)])
        .with_default_command(ServiceCommand::new().execution_timeout(Duration::from_millis(50)))
        .build()
        .await;
    cluster.transport.set(&node(1), Behavior::Hang);
    cluster.transport.set(&node(2), Behavior::Hang);

    let result = cluster.invoke("order.create", InvokeRequest::new()).await;

    assert_error_kind(&result, ErrorKind::RetryExhausted);
    assert!(result.unwrap_err().is_timeout());
    assert!(!cluster.health.is_healthy(&node(1)).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remote_error_is_terminal() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1), node(2)])
        .build()
        .await;
    cluster.transport.set(&node(1), Behavior::fault(409, "duplicate order"));
    cluster.transport.set(&node(2), Behavior::fault(409, "duplicate order"));

    let result = cluster.invoke("order.create", InvokeRequest::new()).await;

    assert_error_kind(&result, ErrorKind::Remote);
    assert_eq!(cluster.transport.call_count(), 1);
    assert_breaker_state(&cluster.invoker, "order.create", CircuitState::Closed);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_fallback_when_circuit_forced_open() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1)])
        .with_command("order.create", ServiceCommand::new().force_open(true).fallback(true))
        .build()
        .await;
    cluster
        .invoker
        .fallbacks()
        .register("order.create", Fallback::value(serde_json::json!({ "status": "queued" })));

    let reply = cluster.invoke("order.create", InvokeRequest::new()).await.unwrap();

    assert_eq!(reply["status"], "queued");
    assert_eq!(cluster.transport.call_count(), 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_hash_selection_is_sticky_per_key() {
    let cluster = TestCluster::builder()
        .with_service("order.create", [node(1), node(2), node(3)])
        .build()
        .await;

    let first = cluster.invoke("order.create", InvokeRequest::new().key("customer-42")).await.unwrap();
    for _ in 0..5 {
        let again = cluster.invoke("order.create", InvokeRequest::new().key("customer-42")).await.unwrap();
        assert_eq!(again, first);
    }

    cluster.shutdown().await;
}
