//! Integration tests for the Consumer ↔ Producer flow over the in-memory gateway.
//!
//! These tests verify the behaviors callers rely on end to end:
//! 1. A record published by a Producer reaches the Consumer's handler unchanged
//! 2. A Consumer started before its topic exists picks up the first publish on its own
//! 3. A Consumer started while the gateway is down connects once it comes back

use kafka_rest_client::testing::MemoryGateway;
use kafka_rest_client::{
    ConnectOptions, Consumer, ConsumerState, GatewayError, Message, Producer,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RETRY: Duration = Duration::from_secs(1);

fn test_schema() -> Value {
    json!({
        "type": "record",
        "name": "Test",
        "fields": [{"name": "foo", "type": "string"}]
    })
}

fn create_consumer(gateway: &MemoryGateway, topic: &str) -> Consumer {
    Consumer::builder()
        .topic(topic)
        .registry(gateway.registry())
        .retry_interval(RETRY)
        .dispose_on_signal(false)
        .build()
        .unwrap()
}

fn create_producer(gateway: &MemoryGateway, topic: &str) -> Producer {
    Producer::builder()
        .topic(topic)
        .schema(test_schema())
        .registry(gateway.registry())
        .retry_interval(Duration::from_millis(300))
        .retry_times(5)
        .build()
        .unwrap()
}

/// Handler pair that records everything it is given.
#[derive(Clone, Default)]
struct Inbox {
    messages: Arc<Mutex<Vec<Message>>>,
    errors: Arc<Mutex<Vec<GatewayError>>>,
}

impl Inbox {
    fn connect_options(&self, group: &str) -> ConnectOptions {
        let messages = Arc::clone(&self.messages);
        let errors = Arc::clone(&self.errors);
        ConnectOptions::new(group, move |message| messages.lock().unwrap().push(message))
            .on_error(move |error| errors.lock().unwrap().push(error))
    }

    fn values(&self) -> Vec<Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.value.clone())
            .collect()
    }

    fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

#[tokio::test(start_paused = true)]
async fn test_produce_then_consume_round_trip() {
    let gateway = MemoryGateway::new();
    let producer = create_producer(&gateway, "round-trip");
    producer.produce(json!({"foo": "bar"})).await.unwrap();

    let consumer = create_consumer(&gateway, "round-trip");
    let inbox = Inbox::default();
    consumer
        .connect(inbox.connect_options("round-trip-group"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = inbox.messages.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].topic, "round-trip");
    assert_eq!(messages[0].value, json!({"foo": "bar"}));
    assert_eq!(inbox.error_count(), 0);

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_consumer_started_before_topic_exists() {
    let gateway = MemoryGateway::new();
    let consumer = create_consumer(&gateway, "created-later");
    let inbox = Inbox::default();

    consumer
        .connect(inbox.connect_options("late-group"))
        .await
        .unwrap();
    assert!(!gateway.topic_exists("created-later"));

    // Let the consumer cycle through a few topic-not-found resets
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(gateway.join_attempts() >= 3);

    let producer = create_producer(&gateway, "created-later");
    producer.produce(json!({"foo": "bar"})).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(inbox.values(), vec![json!({"foo": "bar"})]);
    assert_eq!(inbox.error_count(), 0);
    assert_eq!(consumer.state(), ConsumerState::Connected);

    // Once the topic exists the consumer stays put
    let joins = gateway.joins();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(gateway.joins(), joins);

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_consumer_waits_for_unreachable_gateway() {
    let gateway = MemoryGateway::new();
    gateway.create_topic("outage");
    gateway.set_reachable(false);

    let consumer = Arc::new(create_consumer(&gateway, "outage"));
    let inbox = Inbox::default();
    let connecting = {
        let consumer = Arc::clone(&consumer);
        let options = inbox.connect_options("outage-group");
        tokio::spawn(async move { consumer.connect(options).await })
    };

    // Sample between attempts, never on an attempt boundary
    tokio::time::sleep(RETRY / 2).await;
    let mut last = 0;
    for _ in 0..4 {
        let retries = consumer.connect_retries();
        assert!(retries > last, "retry counter should keep growing");
        last = retries;
        tokio::time::sleep(RETRY).await;
    }
    assert!(!connecting.is_finished());

    gateway.set_reachable(true);
    connecting.await.unwrap().unwrap();
    assert_eq!(consumer.connect_retries(), 0);

    create_producer(&gateway, "outage")
        .produce(json!({"foo": "after-outage"}))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(inbox.values(), vec![json!({"foo": "after-outage"})]);

    consumer.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_consumers_in_different_groups_each_receive() {
    let gateway = MemoryGateway::new();
    gateway.create_topic("fan-out");

    let first = create_consumer(&gateway, "fan-out");
    let second = create_consumer(&gateway, "fan-out");
    let first_inbox = Inbox::default();
    let second_inbox = Inbox::default();
    first
        .connect(first_inbox.connect_options("group-a"))
        .await
        .unwrap();
    second
        .connect(second_inbox.connect_options("group-b"))
        .await
        .unwrap();

    let producer = create_producer(&gateway, "fan-out");
    for n in 0..3 {
        producer
            .produce(json!({"foo": format!("msg-{}", n)}))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let expected: Vec<Value> = (0..3).map(|n| json!({"foo": format!("msg-{}", n)})).collect();
    assert_eq!(first_inbox.values(), expected);
    assert_eq!(second_inbox.values(), expected);

    first.dispose().await;
    second.dispose().await;
    assert_eq!(gateway.shutdowns(), 2);
}
