//! RPC integration tests requiring a running RabbitMQ instance.
//!
//! Run with: AMQP_URL=amqp://localhost:5672 cargo test --test amqp_rpc -- --ignored

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use uuid::Uuid;

use courier::{MessageBus, RpcHandler, RpcReply, Topology, TransportError};

use common::{test_codec, test_config};

/// Handler returning the order for any GetOrder request.
struct GetOrderHandler;

impl RpcHandler for GetOrderHandler {
    fn handle(
        &self,
        request: Value,
    ) -> BoxFuture<'static, Result<RpcReply, TransportError>> {
        Box::pin(async move {
            Ok(RpcReply::new(
                "courier.test.Order",
                json!({"id": request["id"], "status": "PENDING"}),
            ))
        })
    }
}

/// Handler rejecting every request with a business error.
struct RejectingHandler;

impl RpcHandler for RejectingHandler {
    fn handle(
        &self,
        _request: Value,
    ) -> BoxFuture<'static, Result<RpcReply, TransportError>> {
        Box::pin(async move { Err(TransportError::Handler("order not found".to_string())) })
    }
}

async fn connect_pair(queue: &str) -> (MessageBus, MessageBus) {
    let topology = Topology::new().queue(queue);
    let server = MessageBus::connect(test_config(), test_codec(), topology.clone())
        .await
        .expect("connect server bus");
    let client = MessageBus::connect(test_config(), test_codec(), topology)
        .await
        .expect("connect client bus");
    (server, client)
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn test_call_round_trip() {
    let queue = format!("orders.get.queue.{}", Uuid::new_v4());
    let (server, client) = connect_pair(&queue).await;

    server
        .register_handler(&queue, "courier.test.GetOrder", Arc::new(GetOrderHandler))
        .await
        .expect("register handler");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    let reply = client
        .call(&queue, "courier.test.GetOrder", &json!({"id": 42}), None)
        .await
        .expect("call succeeds");

    assert_eq!(reply["id"], json!(42));
    assert_eq!(reply["status"], json!("PENDING"));
    assert!(
        start.elapsed() < Duration::from_millis(200),
        "round trip took {:?}",
        start.elapsed()
    );
    assert_eq!(client.outstanding_calls(), 0);
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn test_call_without_consumer_times_out() {
    let queue = format!("orders.void.queue.{}", Uuid::new_v4());
    let topology = Topology::new().queue(&queue);
    let client = MessageBus::connect(test_config(), test_codec(), topology)
        .await
        .expect("connect client bus");

    let start = Instant::now();
    let err = client
        .call(
            &queue,
            "courier.test.GetOrder",
            &json!({"id": 1}),
            Some(Duration::from_millis(100)),
        )
        .await
        .expect_err("no consumer, must time out");

    let elapsed = start.elapsed();
    assert!(matches!(err, TransportError::Timeout { .. }), "{:?}", err);
    assert!(elapsed >= Duration::from_millis(100), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "fired late: {:?}", elapsed);

    // no leaked pending request
    assert_eq!(client.outstanding_calls(), 0);
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn test_business_error_is_typed_not_transport() {
    let queue = format!("orders.reject.queue.{}", Uuid::new_v4());
    let (server, client) = connect_pair(&queue).await;

    server
        .register_handler(&queue, "courier.test.GetOrder", Arc::new(RejectingHandler))
        .await
        .expect("register handler");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = client
        .call(&queue, "courier.test.GetOrder", &json!({"id": 7}), None)
        .await
        .expect_err("handler rejects");

    match err {
        TransportError::Handler(message) => assert!(message.contains("order not found")),
        other => panic!("expected Handler error, got {:?}", other),
    }
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn test_concurrent_calls_multiplex_one_connection() {
    let queue = format!("orders.echo.queue.{}", Uuid::new_v4());
    let (server, client) = connect_pair(&queue).await;

    server
        .register_handler(&queue, "courier.test.GetOrder", Arc::new(GetOrderHandler))
        .await
        .expect("register handler");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = Arc::new(client);
    // ids start at 1: a zero-valued field is omitted from proto3 JSON
    let calls: Vec<_> = (1..=16)
        .map(|i| {
            let client = Arc::clone(&client);
            let queue = queue.clone();
            tokio::spawn(async move {
                client
                    .call(&queue, "courier.test.GetOrder", &json!({"id": i}), None)
                    .await
                    .map(|reply| (i, reply))
            })
        })
        .collect();

    for call in calls {
        let (i, reply) = call.await.expect("task").expect("call succeeds");
        // each caller gets the reply correlated to its own request
        assert_eq!(reply["id"], json!(i));
    }
    assert_eq!(client.outstanding_calls(), 0);
}

#[tokio::test]
#[ignore = "Requires RabbitMQ"]
async fn test_topology_redeclaration_is_noop() {
    let queue = format!("orders.decl.queue.{}", Uuid::new_v4());
    let topology = Topology::new()
        .queue(&queue)
        .bound_queue("courier.events", format!("{}.events", queue), "order.*");

    let first = MessageBus::connect(test_config(), test_codec(), topology.clone())
        .await
        .expect("first declaration");
    // identical topology declared again on a second connection
    let second = MessageBus::connect(test_config(), test_codec(), topology)
        .await
        .expect("second declaration is a no-op");

    first.close().await.expect("close");
    second.close().await.expect("close");
}
