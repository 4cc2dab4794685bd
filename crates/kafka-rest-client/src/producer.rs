//! Producer API for publishing records through the REST gateway.
//!
//! A [`Producer`] is bound to one topic and one set of Avro schemas for its whole lifetime.
//! The topic handle is created once at construction from the shared gateway handle, so a
//! later [`GatewayRegistry::reset`] does not reach producers that already exist.
//!
//! ## Retries
//!
//! Failed publishes are retried on a fixed interval (no exponential growth) up to
//! `retry_times` retries after the first attempt. Each failure is logged with the topic and
//! attempt number. When the budget runs out the caller gets a single
//! [`ClientError::RetriesExhausted`] carrying the topic, the number of attempts made and the
//! last gateway error.
//!
//! Dropping the future returned by [`Producer::produce`] is the only way to stop retrying.
//!
//! ## Schema selection
//!
//! | Builder                          | Published with              |
//! |----------------------------------|-----------------------------|
//! | `.schema(value)`                 | value schema                |
//! | `.schema(value).key_schema(key)` | key schema and value schema |
//!
//! ## Example
//!
//! ```ignore
//! use kafka_rest_client::Producer;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let producer = Producer::builder()
//!     .topic("orders")
//!     .schema(json!({
//!         "type": "record",
//!         "name": "Order",
//!         "fields": [{"name": "foo", "type": "string"}]
//!     }))
//!     .retry_times(5)
//!     .retry_interval(Duration::from_millis(300))
//!     .build()?;
//!
//! let result = producer.produce(json!({"foo": "bar"})).await?;
//! println!("Published at offset {:?}", result.offsets[0].offset);
//! ```
//!
//! [`GatewayRegistry::reset`]: crate::GatewayRegistry::reset

use crate::config::ClientConfig;
use crate::connection::GatewayRegistry;
use crate::error::{ClientError, Result};
use crate::gateway::{AvroSchema, ProducerRecord, PublishResult, SchemaBinding, TopicHandle};
use crate::retry::{retry_with_fixed_interval, RetryPolicy};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, Instrument, Span};

/// A schema as handed to the builder, validated by [`ProducerBuilder::build`].
#[derive(Debug, Clone)]
pub enum SchemaDefinition {
    Parsed(AvroSchema),
    Text(String),
}

impl SchemaDefinition {
    fn parse(self) -> Result<AvroSchema> {
        match self {
            SchemaDefinition::Parsed(schema) => Ok(schema),
            SchemaDefinition::Text(text) => AvroSchema::parse(&text),
        }
    }
}

impl From<AvroSchema> for SchemaDefinition {
    fn from(schema: AvroSchema) -> Self {
        SchemaDefinition::Parsed(schema)
    }
}

impl From<&str> for SchemaDefinition {
    fn from(text: &str) -> Self {
        SchemaDefinition::Text(text.to_string())
    }
}

impl From<String> for SchemaDefinition {
    fn from(text: String) -> Self {
        SchemaDefinition::Text(text)
    }
}

impl From<Value> for SchemaDefinition {
    fn from(definition: Value) -> Self {
        SchemaDefinition::Text(definition.to_string())
    }
}

impl From<&Value> for SchemaDefinition {
    fn from(definition: &Value) -> Self {
        SchemaDefinition::Text(definition.to_string())
    }
}

/// Builder for [`Producer`].
///
/// `topic` and `schema` are required. Retry settings default to
/// `KAFKA_REST_PRODUCER_RETRY_MS` / `KAFKA_REST_PRODUCER_RETRY_TIMES`, or 5 seconds and
/// 3 retries.
pub struct ProducerBuilder {
    topic: Option<String>,
    schema: Option<SchemaDefinition>,
    key_schema: Option<SchemaDefinition>,
    retry_interval: Option<Duration>,
    retry_times: Option<u32>,
    registry: Option<Arc<GatewayRegistry>>,
    parent_span: Option<Span>,
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self {
            topic: None,
            schema: None,
            key_schema: None,
            retry_interval: None,
            retry_times: None,
            registry: None,
            parent_span: None,
        }
    }

    /// Topic to publish to (required).
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Avro schema of record values (required).
    pub fn schema(mut self, schema: impl Into<SchemaDefinition>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Avro schema of record keys. When set every publish carries both schemas.
    pub fn key_schema(mut self, schema: impl Into<SchemaDefinition>) -> Self {
        self.key_schema = Some(schema.into());
        self
    }

    /// Wait between publish attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    /// Retries after the first attempt. `retry_times(n)` allows at most `n + 1` publishes.
    pub fn retry_times(mut self, retries: u32) -> Self {
        self.retry_times = Some(retries);
        self
    }

    /// Registry that supplies the gateway handle (default: the process-wide registry).
    pub fn registry(mut self, registry: Arc<GatewayRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Parent span for the producer's `kafka.producer` span.
    pub fn span(mut self, parent: Span) -> Self {
        self.parent_span = Some(parent);
        self
    }

    /// Validate the schemas and bind the topic handle.
    ///
    /// # Errors
    ///
    /// - `Config` if the topic or value schema is missing
    /// - `Config` if a schema is not valid Avro
    /// - `Config` if a retry setting falls back to a malformed environment variable
    pub fn build(self) -> Result<Producer> {
        let topic = self
            .topic
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ClientError::Config("producer topic is required".to_string()))?;
        let value_schema = self
            .schema
            .ok_or_else(|| ClientError::Config("producer schema is required".to_string()))?
            .parse()?;

        let schemas = match self.key_schema {
            Some(key) => SchemaBinding::KeyValue {
                key: key.parse()?,
                value: value_schema,
            },
            None => SchemaBinding::Value(value_schema),
        };

        let policy = match (self.retry_interval, self.retry_times) {
            (Some(interval), Some(retries)) => RetryPolicy::new(retries, interval),
            (interval, retries) => {
                let config = ClientConfig::from_env()?;
                RetryPolicy::new(
                    retries.unwrap_or(config.producer_retry_times),
                    interval.unwrap_or(config.producer_retry_interval),
                )
            }
        };

        let registry = self.registry.unwrap_or_else(GatewayRegistry::global);
        let (gateway, url) = registry.ensure();
        let handle = gateway.topic(&topic);

        let span = match &self.parent_span {
            Some(parent) => info_span!(parent: parent, "kafka.producer", topic = %topic),
            None => info_span!("kafka.producer", topic = %topic),
        };

        info!(
            parent: &span,
            url = %url,
            keyed = schemas.key_schema().is_some(),
            max_retries = policy.max_retries,
            retry_interval_ms = policy.interval.as_millis() as u64,
            "Producer initialized"
        );

        Ok(Producer {
            topic,
            schemas,
            policy,
            handle,
            span,
        })
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes records to one topic with bounded, fixed-interval retries.
pub struct Producer {
    topic: String,
    schemas: SchemaBinding,
    policy: RetryPolicy,
    handle: Arc<dyn TopicHandle>,
    span: Span,
}

impl Producer {
    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::new()
    }

    /// Publish one record, retrying on failure.
    ///
    /// Accepts a [`ProducerRecord`] or a bare `serde_json::Value` (published without a key).
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` once `retry_times + 1` attempts have failed.
    pub async fn produce(&self, record: impl Into<ProducerRecord>) -> Result<PublishResult> {
        let records = [record.into()];
        let records = &records[..];

        let result = retry_with_fixed_interval(&self.policy, &self.topic, move |_attempt| {
            self.handle.produce(&self.schemas, records)
        })
        .instrument(self.span.clone())
        .await?;

        debug!(
            parent: &self.span,
            offsets = ?result.offsets.iter().map(|o| o.offset).collect::<Vec<_>>(),
            "Record published"
        );
        Ok(result)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn schemas(&self) -> &SchemaBinding {
        &self.schemas
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.topic)
            .field("schemas", &self.schemas)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::testing::MemoryGateway;
    use serde_json::json;

    fn record_schema() -> Value {
        json!({
            "type": "record",
            "name": "Test",
            "fields": [{"name": "foo", "type": "string"}]
        })
    }

    fn builder(gateway: &MemoryGateway) -> ProducerBuilder {
        Producer::builder()
            .topic("orders")
            .schema(record_schema())
            .registry(gateway.registry())
            .retry_interval(Duration::from_millis(300))
            .retry_times(3)
    }

    #[test]
    fn test_build_requires_topic_and_schema() {
        let gateway = MemoryGateway::new();

        let err = Producer::builder()
            .schema(record_schema())
            .registry(gateway.registry())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));

        let err = Producer::builder()
            .topic("orders")
            .registry(gateway.registry())
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_build_rejects_invalid_schema() {
        let gateway = MemoryGateway::new();
        let err = builder(&gateway)
            .key_schema(json!({"type": "nope"}))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_schema_binding_selection() {
        let gateway = MemoryGateway::new();

        let plain = builder(&gateway).build().unwrap();
        assert!(plain.schemas().key_schema().is_none());

        let keyed = builder(&gateway).key_schema(r#""string""#).build().unwrap();
        assert_eq!(
            keyed.schemas().key_schema().map(|s| s.as_str()),
            Some(r#""string""#)
        );
        assert_eq!(keyed.topic(), "orders");
        assert_eq!(keyed.retry_policy().max_retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_publishes_once_on_success() {
        let gateway = MemoryGateway::new();
        let producer = builder(&gateway).build().unwrap();

        let result = producer.produce(json!({"foo": "bar"})).await.unwrap();
        assert_eq!(result.offsets[0].offset, Some(0));
        assert_eq!(result.key_schema_id, None);
        assert_eq!(gateway.publish_attempts(), 1);
        assert_eq!(gateway.published("orders"), vec![json!({"foo": "bar"})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_produce_reports_key_schema() {
        let gateway = MemoryGateway::new();
        let producer = builder(&gateway).key_schema(r#""string""#).build().unwrap();

        let result = producer
            .produce(ProducerRecord::with_key(json!("user-1"), json!({"foo": "bar"})))
            .await
            .unwrap();
        assert!(result.key_schema_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_recovers_after_transient_failures() {
        let gateway = MemoryGateway::new();
        gateway.fail_publishes(2);
        let producer = builder(&gateway).build().unwrap();

        producer.produce(json!({"foo": "bar"})).await.unwrap();
        assert_eq!(gateway.publish_attempts(), 3);
        assert_eq!(gateway.published("orders").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_produce_gives_up_after_n_plus_one_attempts() {
        let gateway = MemoryGateway::new();
        gateway.fail_publishes(u32::MAX);
        let producer = builder(&gateway).retry_times(5).build().unwrap();

        let err = producer.produce(json!({"foo": "bar"})).await.unwrap_err();
        assert_eq!(gateway.publish_attempts(), 6);
        match err {
            ClientError::RetriesExhausted {
                topic,
                attempts,
                source,
            } => {
                assert_eq!(topic, "orders");
                assert_eq!(attempts, 6);
                assert!(matches!(source, GatewayError::Unreachable(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_is_bound_at_construction() {
        let gateway = MemoryGateway::new();
        let registry = gateway.registry();
        let producer = Producer::builder()
            .topic("orders")
            .schema(record_schema())
            .registry(Arc::clone(&registry))
            .retry_times(0)
            .retry_interval(Duration::from_secs(1))
            .build()
            .unwrap();

        registry.reset();
        registry.set_url_override(Some("memory://elsewhere".to_string()));
        producer.produce(json!({"foo": "bar"})).await.unwrap();

        assert_eq!(registry.ensure().1, "memory://elsewhere");
        assert_eq!(gateway.published("orders").len(), 1);
    }
}
