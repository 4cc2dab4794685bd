//! Kafka REST Client - resilient Consumer and Producer APIs
//!
//! This crate consumes and publishes Kafka topics through a Kafka REST Proxy (v2 API).
//! It absorbs the usual failure modes of a gateway deployment: the proxy being down or
//! restarting, consumers subscribing before their topic exists, and connections dropped
//! mid-stream.
//!
//! - [`Consumer`] joins a consumer group, subscribes to one topic and retries the join
//!   without bound. Topic-not-found and connection resets trigger a full reset instead of
//!   an error.
//! - [`Producer`] publishes with a fixed retry interval and a hard cap on attempts.
//! - [`GatewayRegistry`] hands out one shared gateway handle per process (or per registry).
//!
//! # Examples
//!
//! ## Producer
//!
//! ```ignore
//! use kafka_rest_client::Producer;
//! use serde_json::json;
//!
//! let producer = Producer::builder()
//!     .topic("orders")
//!     .schema(json!({
//!         "type": "record",
//!         "name": "Order",
//!         "fields": [{"name": "foo", "type": "string"}]
//!     }))
//!     .build()?;
//!
//! producer.produce(json!({"foo": "bar"})).await?;
//! ```
//!
//! ## Consumer
//!
//! ```ignore
//! use kafka_rest_client::{ConnectOptions, Consumer};
//!
//! let consumer = Consumer::builder().topic("orders").build()?;
//! consumer
//!     .connect(ConnectOptions::new("analytics", |message| {
//!         println!("Received: {}", message.value);
//!     }))
//!     .await?;
//! ```
//!
//! ## Gateway URL
//!
//! ```ignore
//! // Explicit override > KAFKA_REST_PROXY_URL > http://127.0.0.1:8082
//! kafka_rest_client::set_gateway_url("http://rest-proxy:8082");
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod gateway;
pub mod producer;
pub mod rest;
pub mod retry;
pub mod shutdown;
pub mod stream;
pub mod testing;

pub use config::ClientConfig;
pub use connection::{clear_gateway_url, set_gateway_url, GatewayFactory, GatewayRegistry};
pub use consumer::{
    ConnectOptions, Consumer, ConsumerBuilder, ConsumerState, ErrorHandler, MessageHandler,
};
pub use error::{ClientError, GatewayError, Result, StreamErrorKind};
pub use gateway::{
    AvroSchema, ConsumerInstance, Gateway, JoinOptions, Message, MessageFormat, OffsetReset,
    ProducerRecord, PublishResult, RecordOffset, SchemaBinding, TopicHandle,
};
pub use producer::{Producer, ProducerBuilder, SchemaDefinition};
pub use rest::RestGateway;
pub use retry::{retry_with_fixed_interval, RetryPolicy};
pub use stream::{MessageStream, StreamEvent, StreamListener, StreamSender};
