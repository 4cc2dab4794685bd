//! Push-based message stream.
//!
//! A [`MessageStream`] is what a consumer instance hands back after subscribing to a topic.
//! The gateway side pushes [`StreamEvent`]s through a [`StreamSender`]; the consumer side
//! attaches exactly one [`StreamListener`] which receives them on a dedicated dispatch task:
//!
//! ```text
//! poll task ──StreamSender──► mpsc ──► dispatch task ──► listener.on_data / on_error
//! ```
//!
//! Events are dispatched one at a time, in the order they were sent, so the listener never
//! sees two batches concurrently. Detaching aborts the dispatch task, which drops the
//! receiving half; the sender notices and the gateway stops polling.
//!
//! A listener that panics while handling a batch ends the stream. The rest of that batch is
//! dropped and the listener is told through `on_error` with a [`GatewayError::Closed`], the
//! same way it would learn about the other side going away.

use crate::error::{ClientError, GatewayError};
use crate::gateway::Message;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Default capacity of the event channel between poller and dispatcher.
pub const DEFAULT_STREAM_CAPACITY: usize = 16;

/// An event emitted by a message stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A batch of decoded messages, in broker order.
    Data(Vec<Message>),
    /// A transport or gateway error.
    Error(GatewayError),
}

/// Receives stream events. Called from the stream's dispatch task.
pub trait StreamListener: Send + Sync {
    fn on_data(&self, batch: Vec<Message>);
    fn on_error(&self, error: GatewayError);
}

/// Sending half of a message stream, held by the gateway's poll task.
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamSender {
    /// Push a batch. Returns `false` once the stream has been detached or dropped.
    pub async fn send_data(&self, batch: Vec<Message>) -> bool {
        self.tx.send(StreamEvent::Data(batch)).await.is_ok()
    }

    /// Push an error. Returns `false` once the stream has been detached or dropped.
    pub async fn send_error(&self, error: GatewayError) -> bool {
        self.tx.send(StreamEvent::Error(error)).await.is_ok()
    }

    /// Push a batch without waiting for channel capacity.
    pub fn try_send_data(&self, batch: Vec<Message>) -> bool {
        self.tx.try_send(StreamEvent::Data(batch)).is_ok()
    }

    /// Push an error without waiting for channel capacity.
    pub fn try_send_error(&self, error: GatewayError) -> bool {
        self.tx.try_send(StreamEvent::Error(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the receiving side is gone.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// A subscribed, push-based sequence of message batches for one topic.
pub struct MessageStream {
    topic: String,
    events: Option<mpsc::Receiver<StreamEvent>>,
    dispatch: Option<JoinHandle<()>>,
    source: Option<JoinHandle<()>>,
}

impl MessageStream {
    /// Create a stream and the sender that feeds it.
    pub fn channel(topic: impl Into<String>) -> (StreamSender, MessageStream) {
        Self::with_capacity(topic, DEFAULT_STREAM_CAPACITY)
    }

    pub fn with_capacity(topic: impl Into<String>, capacity: usize) -> (StreamSender, MessageStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stream = MessageStream {
            topic: topic.into(),
            events: Some(rx),
            dispatch: None,
            source: None,
        };
        (StreamSender { tx }, stream)
    }

    /// Tie a producing task (e.g. the poll loop) to this stream's lifetime.
    pub fn with_source(mut self, source: JoinHandle<()>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether a listener is currently attached.
    pub fn is_attached(&self) -> bool {
        self.dispatch.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Bind `listener` to this stream and start dispatching.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `AlreadyAttached` if a listener is already bound
    /// - `StreamDetached` if a previous listener was detached
    pub fn attach(&mut self, listener: Arc<dyn StreamListener>) -> Result<(), ClientError> {
        if self.dispatch.is_some() {
            return Err(ClientError::AlreadyAttached(self.topic.clone()));
        }
        let mut events = self
            .events
            .take()
            .ok_or_else(|| ClientError::StreamDetached(self.topic.clone()))?;

        let topic = self.topic.clone();
        self.dispatch = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let dispatched = catch_unwind(AssertUnwindSafe(|| match event {
                    StreamEvent::Data(batch) => listener.on_data(batch),
                    StreamEvent::Error(error) => listener.on_error(error),
                }));
                if let Err(payload) = dispatched {
                    let reason = panic_message(payload.as_ref());
                    error!(topic = %topic, panic = %reason, "Stream listener panicked");
                    // Close the channel first so the source stops before the listener reacts.
                    drop(events);
                    let closed = GatewayError::Closed(format!("listener panicked: {}", reason));
                    if catch_unwind(AssertUnwindSafe(|| listener.on_error(closed))).is_err() {
                        error!(topic = %topic, "Stream listener panicked again on close");
                    }
                    return;
                }
            }
            debug!(topic = %topic, "Message stream ended");
        }));
        Ok(())
    }

    /// Remove the listener. Safe to call repeatedly and on never-attached streams.
    pub fn detach(&mut self) {
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
            debug!(topic = %self.topic, "Detached stream listener");
        }
        // A never-attached stream still owns its receiver; drop it so the sender stops.
        self.events = None;
        if let Some(source) = self.source.take() {
            source.abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("topic", &self.topic)
            .field("attached", &self.is_attached())
            .finish()
    }
}
