//! Integration tests for Producer retry behavior against the in-memory gateway.

use futures::future::join_all;
use kafka_rest_client::testing::MemoryGateway;
use kafka_rest_client::{ClientError, GatewayError, Producer, ProducerRecord};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn test_schema() -> Value {
    json!({
        "type": "record",
        "name": "Test",
        "fields": [{"name": "foo", "type": "string"}]
    })
}

fn create_producer(gateway: &MemoryGateway, retry_times: u32, interval: Duration) -> Producer {
    Producer::builder()
        .topic("producer-it")
        .schema(test_schema())
        .registry(gateway.registry())
        .retry_interval(interval)
        .retry_times(retry_times)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_configured_retries() {
    let gateway = MemoryGateway::new();
    gateway.set_reachable(false);
    let producer = create_producer(&gateway, 5, Duration::from_millis(300));

    let started = tokio::time::Instant::now();
    let err = producer.produce(json!({"foo": "bar"})).await.unwrap_err();

    // 1 attempt + 5 retries, 300ms apart
    assert_eq!(gateway.publish_attempts(), 6);
    assert_eq!(started.elapsed(), Duration::from_millis(1_500));
    assert_eq!(err.attempts(), Some(6));
    match err {
        ClientError::RetriesExhausted { topic, source, .. } => {
            assert_eq!(topic, "producer-it");
            assert!(matches!(source, GatewayError::Unreachable(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!gateway.topic_exists("producer-it"));
}

#[tokio::test(start_paused = true)]
async fn test_recovers_when_gateway_comes_back() {
    let gateway = MemoryGateway::new();
    gateway.set_reachable(false);
    let producer = create_producer(&gateway, 5, Duration::from_secs(1));

    let switch = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            gateway.set_reachable(true);
        })
    };

    let result = producer.produce(json!({"foo": "bar"})).await.unwrap();
    switch.await.unwrap();

    assert_eq!(result.offsets.len(), 1);
    assert_eq!(gateway.publish_attempts(), 4);
    assert_eq!(gateway.published("producer-it"), vec![json!({"foo": "bar"})]);
}

#[tokio::test(start_paused = true)]
async fn test_keyed_records_carry_key() {
    let gateway = MemoryGateway::new();
    let producer = Producer::builder()
        .topic("producer-it")
        .schema(test_schema())
        .key_schema(json!("string"))
        .registry(gateway.registry())
        .build()
        .unwrap();

    let result = producer
        .produce(ProducerRecord::with_key(json!("user-42"), json!({"foo": "bar"})))
        .await
        .unwrap();

    assert_eq!(result.key_schema_id, Some(1));
    assert_eq!(gateway.published("producer-it"), vec![json!({"foo": "bar"})]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_produces_share_one_handle() {
    let gateway = MemoryGateway::new();
    let producer = Arc::new(create_producer(&gateway, 3, Duration::from_millis(100)));

    let sends = (0..10).map(|n| {
        let producer = Arc::clone(&producer);
        async move { producer.produce(json!({"foo": format!("msg-{}", n)})).await }
    });
    let results = join_all(sends).await;

    assert!(results.iter().all(|r| r.is_ok()));
    let mut offsets: Vec<i64> = results
        .into_iter()
        .filter_map(|r| r.ok())
        .filter_map(|r| r.offsets[0].offset)
        .collect();
    offsets.sort_unstable();
    assert_eq!(offsets, (0..10).collect::<Vec<_>>());
    assert_eq!(gateway.publish_attempts(), 10);
}
