//! HTTP gateway for the Kafka REST Proxy (v2 API).
//!
//! Maps the [`Gateway`] traits onto the proxy's endpoints:
//!
//! | Operation              | Request                                   |
//! |------------------------|-------------------------------------------|
//! | join                   | `POST /consumers/{group}`                 |
//! | subscribe              | `POST {base_uri}/subscription`            |
//! | poll (stream source)   | `GET {base_uri}/records`                  |
//! | shutdown               | `DELETE {base_uri}`                       |
//! | produce                | `POST /topics/{topic}`                    |
//!
//! Schema encoding happens inside the proxy: this client only ships JSON records along with
//! the schema text. Group and topic names are percent-encoded as single path segments.
//!
//! Once a stream is established, losing the proxy (connection refused, timeouts) or the
//! proxy losing the consumer instance (error code 40403, e.g. after a restart) is reported
//! on the stream as [`GatewayError::ConnectionReset`], so the consumer rejoins instead of
//! polling a dead instance forever.

use crate::error::{
    GatewayError, ERROR_CODE_CONSUMER_INSTANCE_NOT_FOUND, ERROR_CODE_TOPIC_NOT_FOUND,
};
use crate::gateway::{
    ConsumerInstance, Gateway, JoinOptions, Message, MessageFormat, OffsetReset,
    ProducerRecord, PublishResult, SchemaBinding, TopicHandle,
};
use crate::stream::{MessageStream, StreamSender};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Content type for REST Proxy v2 control requests.
pub const CONTENT_TYPE_V2_JSON: &str = "application/vnd.kafka.v2+json";

/// Content type for records embedded in `format`.
pub fn embedded_content_type(format: MessageFormat) -> String {
    format!("application/vnd.kafka.{}.v2+json", format.as_str())
}

#[derive(Debug, Serialize)]
struct CreateConsumerRequest<'a> {
    format: &'a str,
    #[serde(rename = "auto.offset.reset")]
    auto_offset_reset: &'a str,
    #[serde(rename = "auto.commit.enable")]
    auto_commit_enable: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateConsumerResponse {
    instance_id: String,
    base_uri: String,
}

#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a> {
    topics: [&'a str; 1],
}

#[derive(Debug, Serialize)]
struct ProduceRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    key_schema: Option<&'a str>,
    value_schema: &'a str,
    records: &'a [ProducerRecord],
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error_code: Option<i32>,
    message: Option<String>,
}

/// `base` with `segments` appended, each percent-encoded as one path segment.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url, GatewayError> {
    let mut url = Url::parse(base)
        .map_err(|e| GatewayError::Unreachable(format!("invalid gateway url '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| GatewayError::Unreachable(format!("gateway url '{}' has no path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Map a poll failure on an established stream to what the consumer should react to.
fn stream_error(error: GatewayError) -> GatewayError {
    match error {
        GatewayError::Unreachable(reason) => GatewayError::ConnectionReset(reason),
        GatewayError::Http {
            error_code: Some(ERROR_CODE_CONSUMER_INSTANCE_NOT_FOUND),
            message,
            ..
        } => GatewayError::ConnectionReset(message),
        other => other,
    }
}

/// Turn a non-success response into a [`GatewayError`].
async fn error_from_response(response: reqwest::Response, topic: Option<&str>) -> GatewayError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
    let error_code = parsed.as_ref().and_then(|b| b.error_code);
    let message = parsed
        .and_then(|b| b.message)
        .unwrap_or_else(|| body.clone());

    if error_code == Some(ERROR_CODE_TOPIC_NOT_FOUND) {
        return GatewayError::TopicNotFound(topic.map(str::to_string).unwrap_or(message));
    }

    GatewayError::Http {
        status: status.as_u16(),
        error_code,
        message,
    }
}

/// Gateway handle backed by the REST Proxy.
#[derive(Debug, Clone)]
pub struct RestGateway {
    base_url: String,
    http: reqwest::Client,
}

impl RestGateway {
    /// Create a handle for `base_url` (e.g. "http://localhost:8082").
    ///
    /// Does not touch the network; connectivity is proven by the first join or publish.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = match reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
        {
            Ok(http) => http,
            Err(e) => {
                warn!(
                    error = %e,
                    "Failed to build HTTP client, falling back to one without timeouts"
                );
                reqwest::Client::new()
            }
        };
        Self::with_client(base_url, http)
    }

    /// Create a handle reusing an existing HTTP client.
    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }
}

#[async_trait]
impl Gateway for RestGateway {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn join(
        &self,
        group: &str,
        options: &JoinOptions,
    ) -> Result<Arc<dyn ConsumerInstance>, GatewayError> {
        let url = endpoint(&self.base_url, &["consumers", group])?;
        let offset_reset = match options.auto_offset_reset {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        };
        let request = CreateConsumerRequest {
            format: options.format.as_str(),
            auto_offset_reset: offset_reset,
            auto_commit_enable: if options.auto_commit_enable { "true" } else { "false" },
        };

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, CONTENT_TYPE_V2_JSON)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, None).await);
        }

        let created: CreateConsumerResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        debug!(
            group = group,
            instance_id = %created.instance_id,
            "Joined consumer group"
        );

        Ok(Arc::new(RestConsumerInstance {
            id: created.instance_id,
            base_uri: created.base_uri.trim_end_matches('/').to_string(),
            http: self.http.clone(),
            format: options.format,
            poll_interval: options.poll_interval,
        }))
    }

    fn topic(&self, topic: &str) -> Arc<dyn TopicHandle> {
        Arc::new(RestTopic {
            name: topic.to_string(),
            base_url: self.base_url.clone(),
            http: self.http.clone(),
        })
    }
}

/// A consumer instance living on the REST Proxy.
#[derive(Debug)]
pub struct RestConsumerInstance {
    id: String,
    base_uri: String,
    http: reqwest::Client,
    format: MessageFormat,
    poll_interval: Duration,
}

impl RestConsumerInstance {
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    async fn fetch_records(
        http: &reqwest::Client,
        url: &str,
        accept: &str,
        topic: &str,
    ) -> Result<Vec<Message>, GatewayError> {
        let response = http.get(url).header(ACCEPT, accept).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response, Some(topic)).await);
        }
        response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    async fn poll_loop(
        http: reqwest::Client,
        url: String,
        accept: String,
        topic: String,
        poll_interval: Duration,
        tx: StreamSender,
    ) {
        loop {
            let fetched = tokio::select! {
                _ = tx.closed() => break,
                fetched = Self::fetch_records(&http, &url, &accept, &topic) => fetched,
            };

            let delivered = match fetched {
                Ok(batch) if batch.is_empty() => true,
                Ok(batch) => tx.send_data(batch).await,
                Err(error) => {
                    warn!(topic = %topic, error = %error, "Failed to fetch records");
                    tx.send_error(stream_error(error)).await
                }
            };
            if !delivered {
                break;
            }

            tokio::select! {
                _ = tx.closed() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        debug!(topic = %topic, "Record poll loop stopped");
    }
}

#[async_trait]
impl ConsumerInstance for RestConsumerInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, GatewayError> {
        let url = format!("{}/subscription", self.base_uri);
        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, CONTENT_TYPE_V2_JSON)
            .json(&SubscriptionRequest { topics: [topic] })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, Some(topic)).await);
        }

        let (tx, stream) = MessageStream::channel(topic);
        let source = tokio::spawn(Self::poll_loop(
            self.http.clone(),
            format!("{}/records", self.base_uri),
            embedded_content_type(self.format),
            topic.to_string(),
            self.poll_interval,
            tx,
        ));

        debug!(instance_id = %self.id, topic = topic, "Subscribed");
        Ok(stream.with_source(source))
    }

    async fn shutdown(&self) -> Result<(), GatewayError> {
        let response = self
            .http
            .delete(&self.base_uri)
            .header(CONTENT_TYPE, CONTENT_TYPE_V2_JSON)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response, None).await);
        }

        debug!(instance_id = %self.id, "Consumer instance deleted");
        Ok(())
    }
}

/// Publish handle for one topic on the REST Proxy.
#[derive(Debug)]
pub struct RestTopic {
    name: String,
    base_url: String,
    http: reqwest::Client,
}

#[async_trait]
impl TopicHandle for RestTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(
        &self,
        schemas: &SchemaBinding,
        records: &[ProducerRecord],
    ) -> Result<PublishResult, GatewayError> {
        let url = endpoint(&self.base_url, &["topics", self.name.as_str()])?;
        let request = ProduceRequest {
            key_schema: schemas.key_schema().map(|s| s.as_str()),
            value_schema: schemas.value_schema().as_str(),
            records,
        };

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, embedded_content_type(MessageFormat::Avro))
            .header(ACCEPT, CONTENT_TYPE_V2_JSON)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_response(response, Some(&self.name)).await);
        }

        let result: PublishResult = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        // The proxy reports per-record failures inside a 200 response.
        if let Some(failed) = result.offsets.iter().find(|o| o.error_code.is_some()) {
            return Err(GatewayError::Http {
                status: status.as_u16(),
                error_code: failed.error_code,
                message: failed
                    .error
                    .clone()
                    .unwrap_or_else(|| "record rejected".to_string()),
            });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamEvent, StreamListener};
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<StreamEvent>);

    impl StreamListener for Forward {
        fn on_data(&self, batch: Vec<Message>) {
            let _ = self.0.send(StreamEvent::Data(batch));
        }

        fn on_error(&self, error: GatewayError) {
            let _ = self.0.send(StreamEvent::Error(error));
        }
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let url = endpoint("http://localhost:8082", &["consumers", "audit team/a"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8082/consumers/audit%20team%2Fa");

        let url = endpoint("http://proxy:8082/kafka", &["topics", "orders"]).unwrap();
        assert_eq!(url.as_str(), "http://proxy:8082/kafka/topics/orders");

        let err = endpoint("not a url", &["topics", "orders"]).unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable(_)));
    }

    #[test]
    fn test_stream_error_mapping() {
        let err = stream_error(GatewayError::Unreachable("connection refused".to_string()));
        assert_eq!(err, GatewayError::ConnectionReset("connection refused".to_string()));

        let err = stream_error(GatewayError::Http {
            status: 404,
            error_code: Some(ERROR_CODE_CONSUMER_INSTANCE_NOT_FOUND),
            message: "Consumer instance not found.".to_string(),
        });
        assert_eq!(
            err,
            GatewayError::ConnectionReset("Consumer instance not found.".to_string())
        );

        let kafka_error = GatewayError::Http {
            status: 500,
            error_code: Some(50002),
            message: "Kafka error".to_string(),
        };
        assert_eq!(stream_error(kafka_error.clone()), kafka_error);
        assert_eq!(
            stream_error(GatewayError::TopicNotFound("orders".to_string())),
            GatewayError::TopicNotFound("orders".to_string())
        );
    }

    #[tokio::test]
    async fn test_poll_against_unreachable_proxy_reports_reset() {
        let (tx, mut stream) = MessageStream::channel("orders");
        let (events_tx, mut events) = mpsc::unbounded_channel();
        stream.attach(Arc::new(Forward(events_tx))).unwrap();

        // Nothing listens on the discard port
        let source = tokio::spawn(RestConsumerInstance::poll_loop(
            reqwest::Client::new(),
            "http://127.0.0.1:9/consumers/audit/instances/gone/records".to_string(),
            embedded_content_type(MessageFormat::Avro),
            "orders".to_string(),
            Duration::from_millis(50),
            tx,
        ));
        let stream = stream.with_source(source);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("listener dropped");
        assert!(
            matches!(event, StreamEvent::Error(GatewayError::ConnectionReset(_))),
            "got {event:?}"
        );
        drop(stream);
    }

    #[test]
    fn test_embedded_content_type() {
        assert_eq!(
            embedded_content_type(MessageFormat::Avro),
            "application/vnd.kafka.avro.v2+json"
        );
        assert_eq!(
            embedded_content_type(MessageFormat::Binary),
            "application/vnd.kafka.binary.v2+json"
        );
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let gateway = RestGateway::new("http://localhost:8082/");
        assert_eq!(gateway.base_url(), "http://localhost:8082");
        let topic = gateway.topic("orders");
        assert_eq!(topic.name(), "orders");
    }

    #[test]
    fn test_produce_request_shape() {
        let records = vec![ProducerRecord::new(serde_json::json!({"foo": "bar"}))];
        let request = ProduceRequest {
            key_schema: None,
            value_schema: "\"string\"",
            records: &records,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("key_schema").is_none());
        assert_eq!(body["value_schema"], "\"string\"");
        assert_eq!(body["records"][0]["value"]["foo"], "bar");
    }

    #[test]
    fn test_create_consumer_request_shape() {
        let request = CreateConsumerRequest {
            format: "avro",
            auto_offset_reset: "earliest",
            auto_commit_enable: "true",
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["format"], "avro");
        assert_eq!(body["auto.offset.reset"], "earliest");
        assert_eq!(body["auto.commit.enable"], "true");
    }
}
