//! Example: publish and consume through a Kafka REST Proxy
//!
//! Starts a consumer on a fresh topic before the topic exists, then publishes a few
//! records. The consumer rides out the "topic not found" phase on its own and prints every
//! record once the first publish creates the topic.
//!
//! # Prerequisites
//!
//! A Kafka REST Proxy (v2 API) with a Schema Registry behind it, e.g. the Confluent
//! `cp-kafka-rest` image listening on port 8082.
//!
//! # Usage
//!
//! ```bash
//! KAFKA_REST_PROXY_URL=http://localhost:8082 \
//! RUST_LOG=kafka_rest_client=debug \
//!     cargo run -p kafka-rest-client --example produce_consume
//! ```
//!
//! Press Ctrl+C to dispose the consumer and exit.

use kafka_rest_client::{ConnectOptions, Consumer, Producer};
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
    let topic = format!("kafka-rest-demo-{}", stamp);
    println!("=== Kafka REST produce/consume demo on '{}' ===\n", topic);

    // 1. Consumer first: the topic does not exist yet
    let consumer = Consumer::builder()
        .topic(&topic)
        .retry_interval(Duration::from_secs(2))
        .build()?;

    consumer
        .connect(
            ConnectOptions::new("kafka-rest-demo", |message| {
                println!(
                    "   ← partition {} offset {}: {}",
                    message.partition, message.offset, message.value
                );
            })
            .on_error(|error| eprintln!("   ! stream error: {}", error)),
        )
        .await?;
    println!("1. Consumer connected (state: {:?})", consumer.state());

    // 2. Publishing creates the topic
    let producer = Producer::builder()
        .topic(&topic)
        .schema(json!({
            "type": "record",
            "name": "Demo",
            "namespace": "com.example",
            "fields": [
                {"name": "foo", "type": "string"},
                {"name": "n", "type": "int"}
            ]
        }))
        .retry_times(5)
        .retry_interval(Duration::from_secs(1))
        .build()?;

    println!("2. Publishing...");
    for n in 0..5 {
        let result = producer.produce(json!({"foo": "bar", "n": n})).await?;
        println!("   → published n={} at {:?}", n, result.offsets[0].offset);
    }

    // 3. Keep consuming until interrupted. The consumer also disposes itself on the
    //    signal; a second dispose is a no-op.
    println!("\n3. Waiting for records (Ctrl+C to stop)...");
    tokio::signal::ctrl_c().await?;
    consumer.dispose().await;
    println!("Consumer disposed, bye");

    Ok(())
}
