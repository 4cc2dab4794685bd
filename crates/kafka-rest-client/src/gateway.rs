//! Broker gateway abstraction.
//!
//! The consumer and producer never talk HTTP directly. They go through three traits that
//! mirror what a REST Proxy offers:
//!
//! ```text
//! Gateway ──join(group)──► ConsumerInstance ──subscribe(topic)──► MessageStream
//!    │                            └──shutdown()
//!    └──topic(name)──► TopicHandle ──produce(schemas, records)──► PublishResult
//! ```
//!
//! [`RestGateway`](crate::RestGateway) implements them against the REST Proxy v2 API and
//! [`MemoryGateway`](crate::testing::MemoryGateway) implements them in memory.

use crate::error::{ClientError, GatewayError};
use crate::stream::MessageStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A record delivered by the gateway, already decoded from its schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    #[serde(default)]
    pub key: Option<Value>,
    pub value: Value,
    pub partition: i32,
    pub offset: i64,
}

/// Embedded format the consumer instance asks the gateway to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Avro,
    Json,
    Binary,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFormat::Avro => "avro",
            MessageFormat::Json => "json",
            MessageFormat::Binary => "binary",
        }
    }
}

/// Where a new consumer group starts reading when it has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
}

/// Parameters sent when joining a consumer group.
///
/// Defaults: Avro values, auto-commit enabled, start from the earliest offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOptions {
    pub format: MessageFormat,
    pub auto_commit_enable: bool,
    pub auto_offset_reset: OffsetReset,
    /// How often a polling gateway asks for new records.
    pub poll_interval: Duration,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            format: MessageFormat::Avro,
            auto_commit_enable: true,
            auto_offset_reset: OffsetReset::Earliest,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// A validated Avro schema, kept as the JSON text the gateway expects.
#[derive(Clone, PartialEq, Eq)]
pub struct AvroSchema {
    raw: Arc<str>,
}

impl AvroSchema {
    /// Parse and validate a schema definition.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the definition is not a valid Avro schema.
    pub fn parse(definition: &str) -> Result<Self, ClientError> {
        apache_avro::Schema::parse_str(definition)
            .map_err(|e| ClientError::Config(format!("invalid Avro schema: {}", e)))?;
        Ok(Self {
            raw: Arc::from(definition.trim()),
        })
    }

    /// Build a schema from a JSON value (e.g. `json!({"type": "record", ...})`).
    pub fn from_json(definition: &Value) -> Result<Self, ClientError> {
        Self::parse(&definition.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for AvroSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AvroSchema").field(&self.as_str()).finish()
    }
}

/// Schemas a producer publishes with. Fixed for the producer's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaBinding {
    /// Value schema only; records are published without keys.
    Value(AvroSchema),
    /// Key and value schemas; records carry a key.
    KeyValue { key: AvroSchema, value: AvroSchema },
}

impl SchemaBinding {
    pub fn value_schema(&self) -> &AvroSchema {
        match self {
            SchemaBinding::Value(value) => value,
            SchemaBinding::KeyValue { value, .. } => value,
        }
    }

    pub fn key_schema(&self) -> Option<&AvroSchema> {
        match self {
            SchemaBinding::Value(_) => None,
            SchemaBinding::KeyValue { key, .. } => Some(key),
        }
    }
}

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerRecord {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<Value>,
    pub value: Value,
}

impl ProducerRecord {
    pub fn new(value: Value) -> Self {
        Self { key: None, value }
    }

    pub fn with_key(key: Value, value: Value) -> Self {
        Self {
            key: Some(key),
            value,
        }
    }
}

impl From<Value> for ProducerRecord {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Where a published record landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOffset {
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub error_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Gateway acknowledgement for a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub offsets: Vec<RecordOffset>,
    #[serde(default)]
    pub key_schema_id: Option<i32>,
    #[serde(default)]
    pub value_schema_id: Option<i32>,
}

/// Handle to a broker gateway.
///
/// One handle is shared by every consumer and producer created from the same
/// [`GatewayRegistry`](crate::GatewayRegistry).
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Base URL this handle talks to.
    fn base_url(&self) -> &str;

    /// Register a consumer in `group`, yielding a session that can subscribe to topics.
    async fn join(
        &self,
        group: &str,
        options: &JoinOptions,
    ) -> Result<Arc<dyn ConsumerInstance>, GatewayError>;

    /// Bind a publish handle for `topic`. Does not touch the network.
    fn topic(&self, topic: &str) -> Arc<dyn TopicHandle>;
}

/// A joined consumer-group session.
#[async_trait]
pub trait ConsumerInstance: Send + Sync {
    fn id(&self) -> &str;

    /// Subscribe to `topic` and start delivering batches on the returned stream.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, GatewayError>;

    /// Leave the group and release the gateway-side instance.
    async fn shutdown(&self) -> Result<(), GatewayError>;
}

/// A publish handle bound to one topic.
#[async_trait]
pub trait TopicHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn produce(
        &self,
        schemas: &SchemaBinding,
        records: &[ProducerRecord],
    ) -> Result<PublishResult, GatewayError>;
}
