//! In-memory gateway for tests and local development.
//!
//! [`MemoryGateway`] behaves like a single-partition broker behind a REST Proxy:
//!
//! - topics are created by the first publish to them
//! - subscribing to a missing topic succeeds, but the stream immediately emits
//!   [`GatewayError::TopicNotFound`]
//! - consumer groups start from the earliest offset and auto-commit whatever was delivered
//!
//! Failure switches let tests drive the consumer and producer through their recovery paths:
//! [`set_reachable`](MemoryGateway::set_reachable), [`fail_publishes`](MemoryGateway::fail_publishes),
//! [`inject_stream_error`](MemoryGateway::inject_stream_error) and
//! [`set_shutdown_delay`](MemoryGateway::set_shutdown_delay).
//!
//! Clones share the same broker, so a registry reset that builds a new handle still sees the
//! same topics.

use crate::connection::GatewayRegistry;
use crate::error::GatewayError;
use crate::gateway::{
    ConsumerInstance, Gateway, JoinOptions, Message, ProducerRecord, PublishResult,
    RecordOffset, SchemaBinding, TopicHandle,
};
use crate::stream::{MessageStream, StreamSender};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Channel capacity for in-memory streams; deliveries never wait on the consumer.
const MEMORY_STREAM_CAPACITY: usize = 1024;

struct Subscription {
    instance_id: String,
    group: String,
    topic: String,
    tx: StreamSender,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Message>>,
    committed: HashMap<(String, String), usize>,
    subscriptions: Vec<Subscription>,
    next_instance: u64,
}

struct Broker {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    failing_publishes: AtomicU32,
    shutdown_delay: Mutex<Option<Duration>>,
    join_attempts: AtomicUsize,
    joins: AtomicUsize,
    shutdowns: AtomicUsize,
    publish_attempts: AtomicUsize,
}

impl Broker {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self, url: &str) -> Result<(), GatewayError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::Unreachable(format!(
                "connect ECONNREFUSED {}",
                url
            )))
        }
    }
}

/// In-memory [`Gateway`].
#[derive(Clone)]
pub struct MemoryGateway {
    base_url: String,
    broker: Arc<Broker>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::with_url("memory://broker")
    }

    pub fn with_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            broker: Arc::new(Broker {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
                failing_publishes: AtomicU32::new(0),
                shutdown_delay: Mutex::new(None),
                join_attempts: AtomicUsize::new(0),
                joins: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                publish_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// A registry whose handles all point at this broker.
    pub fn registry(&self) -> Arc<GatewayRegistry> {
        let broker = Arc::clone(&self.broker);
        Arc::new(
            GatewayRegistry::with_factory(move |url: &str| {
                Arc::new(MemoryGateway {
                    base_url: url.to_string(),
                    broker: Arc::clone(&broker),
                }) as Arc<dyn Gateway>
            })
            .with_env_lookup(|_| None),
        )
    }

    /// Make every call fail with `Unreachable` (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes with `Unreachable`. `u32::MAX` fails forever.
    pub fn fail_publishes(&self, count: u32) {
        self.broker.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Make consumer-instance shutdown take `delay` (simulates a hung DELETE).
    pub fn set_shutdown_delay(&self, delay: Option<Duration>) {
        *self
            .broker
            .shutdown_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    /// Push `error` to every live stream on `topic`. Returns how many streams received it.
    pub fn inject_stream_error(&self, topic: &str, error: GatewayError) -> usize {
        let mut state = self.broker.lock();
        state.subscriptions.retain(|s| !s.tx.is_closed());
        state
            .subscriptions
            .iter()
            .filter(|s| s.topic == topic)
            .filter(|s| s.tx.try_send_error(error.clone()))
            .count()
    }

    /// Create `topic` without publishing to it.
    pub fn create_topic(&self, topic: &str) {
        self.broker
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default();
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.broker.lock().topics.contains_key(topic)
    }

    /// Values published to `topic`, in offset order.
    pub fn published(&self, topic: &str) -> Vec<Value> {
        self.broker
            .lock()
            .topics
            .get(topic)
            .map(|log| log.iter().map(|m| m.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Streams on `topic` whose consumer side is still attached.
    pub fn live_subscriptions(&self, topic: &str) -> usize {
        let mut state = self.broker.lock();
        state.subscriptions.retain(|s| !s.tx.is_closed());
        state
            .subscriptions
            .iter()
            .filter(|s| s.topic == topic)
            .count()
    }

    /// Join calls made, successful or not.
    pub fn join_attempts(&self) -> usize {
        self.broker.join_attempts.load(Ordering::SeqCst)
    }

    /// Successful joins.
    pub fn joins(&self) -> usize {
        self.broker.joins.load(Ordering::SeqCst)
    }

    /// Consumer-instance shutdowns that reached the broker.
    pub fn shutdowns(&self) -> usize {
        self.broker.shutdowns.load(Ordering::SeqCst)
    }

    /// Publish calls made, successful or not.
    pub fn publish_attempts(&self) -> usize {
        self.broker.publish_attempts.load(Ordering::SeqCst)
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn join(
        &self,
        group: &str,
        _options: &JoinOptions,
    ) -> Result<Arc<dyn ConsumerInstance>, GatewayError> {
        self.broker.join_attempts.fetch_add(1, Ordering::SeqCst);
        self.broker.check_reachable(&self.base_url)?;

        let id = {
            let mut state = self.broker.lock();
            state.next_instance += 1;
            format!("memory-consumer-{}", state.next_instance)
        };
        self.broker.joins.fetch_add(1, Ordering::SeqCst);
        debug!(group = group, instance_id = %id, "Memory consumer joined");

        Ok(Arc::new(MemoryConsumerInstance {
            id,
            group: group.to_string(),
            base_url: self.base_url.clone(),
            broker: Arc::clone(&self.broker),
        }))
    }

    fn topic(&self, topic: &str) -> Arc<dyn TopicHandle> {
        Arc::new(MemoryTopic {
            name: topic.to_string(),
            base_url: self.base_url.clone(),
            broker: Arc::clone(&self.broker),
        })
    }
}

struct MemoryConsumerInstance {
    id: String,
    group: String,
    base_url: String,
    broker: Arc<Broker>,
}

#[async_trait]
impl ConsumerInstance for MemoryConsumerInstance {
    fn id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, GatewayError> {
        self.broker.check_reachable(&self.base_url)?;

        let (tx, stream) = MessageStream::with_capacity(topic, MEMORY_STREAM_CAPACITY);
        let mut guard = self.broker.lock();
        let state = &mut *guard;

        let backlog = match state.topics.get(topic) {
            Some(log) => {
                let key = (self.group.clone(), topic.to_string());
                let from = state.committed.get(&key).copied().unwrap_or(0);
                let backlog: Vec<Message> = log[from.min(log.len())..].to_vec();
                let end = log.len();
                state.committed.insert(key, end);
                backlog
            }
            None => {
                tx.try_send_error(GatewayError::TopicNotFound(topic.to_string()));
                return Ok(stream);
            }
        };

        if !backlog.is_empty() {
            tx.try_send_data(backlog);
        }
        state.subscriptions.push(Subscription {
            instance_id: self.id.clone(),
            group: self.group.clone(),
            topic: topic.to_string(),
            tx,
        });
        Ok(stream)
    }

    async fn shutdown(&self) -> Result<(), GatewayError> {
        let delay = *self
            .broker
            .shutdown_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.broker.check_reachable(&self.base_url)?;

        self.broker
            .lock()
            .subscriptions
            .retain(|s| s.instance_id != self.id);
        self.broker.shutdowns.fetch_add(1, Ordering::SeqCst);
        debug!(instance_id = %self.id, "Memory consumer shut down");
        Ok(())
    }
}

struct MemoryTopic {
    name: String,
    base_url: String,
    broker: Arc<Broker>,
}

#[async_trait]
impl TopicHandle for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn produce(
        &self,
        schemas: &SchemaBinding,
        records: &[ProducerRecord],
    ) -> Result<PublishResult, GatewayError> {
        self.broker.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.broker.check_reachable(&self.base_url)?;

        let failing = self
            .broker
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(GatewayError::Unreachable(format!(
                "connect ECONNREFUSED {}",
                self.base_url
            )));
        }

        let mut state = self.broker.lock();
        let state = &mut *state;
        let log = state.topics.entry(self.name.clone()).or_default();

        let mut offsets = Vec::with_capacity(records.len());
        let mut appended = Vec::with_capacity(records.len());
        for record in records {
            let message = Message {
                topic: self.name.clone(),
                key: record.key.clone(),
                value: record.value.clone(),
                partition: 0,
                offset: log.len() as i64,
            };
            offsets.push(RecordOffset {
                partition: Some(0),
                offset: Some(message.offset),
                error_code: None,
                error: None,
            });
            log.push(message.clone());
            appended.push(message);
        }
        let end = log.len();

        state.subscriptions.retain(|s| !s.tx.is_closed());
        for sub in state.subscriptions.iter().filter(|s| s.topic == self.name) {
            if sub.tx.try_send_data(appended.clone()) {
                state
                    .committed
                    .insert((sub.group.clone(), sub.topic.clone()), end);
            }
        }

        Ok(PublishResult {
            offsets,
            key_schema_id: schemas.key_schema().map(|_| 1),
            value_schema_id: Some(2),
        })
    }
}
