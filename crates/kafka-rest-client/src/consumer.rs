//! Consumer API for reading a topic through the REST gateway.
//!
//! A [`Consumer`] owns the lifecycle of exactly one [`MessageStream`]: it joins a consumer
//! group, subscribes to its topic and hands every decoded message to the caller's handler.
//! Broker hiccups are absorbed instead of surfaced.
//!
//! ## Lifecycle
//!
//! ```text
//!            connect()              join + subscribe ok
//!   Idle ──────────────► Connecting ───────────────────► Connected
//!                         ▲      │ join failed:                │
//!                         │      └─ wait retry_interval ──┐    │ TopicNotFound /
//!                         │◄──────────────────────────────┘    │ ConnectionReset
//!                         │                                    ▼
//!                         └────────── wait retry_interval ── Resetting
//!
//!   any state ── dispose() ──► Disposed (terminal)
//! ```
//!
//! - Joining is retried without bound. The retry counter grows by one per failed attempt and
//!   drops back to zero on every successful (re)connect.
//! - `TopicNotFound` and `ConnectionReset` on the stream never reach the error handler. The
//!   stream is torn down, the old group member is shut down in the background (bounded by
//!   a small budget so a hung gateway never delays the rejoin) and the consumer reconnects
//!   after `retry_interval`.
//! - Every other stream error goes to the `on_error` handler, or is logged at WARN when no
//!   handler was registered.
//! - A message handler that panics closes its stream. The panic is logged at ERROR, the rest
//!   of that batch is dropped and the consumer resets as if the connection had dropped.
//! - [`Consumer::dispose`] is idempotent. It cancels pending backoff timers, detaches the
//!   stream and waits for the gateway-side shutdown of the group member.
//!
//! ## Termination signals
//!
//! After the first successful connect the consumer disposes itself on SIGINT or SIGTERM.
//! Installing the hook replaces the default "terminate on Ctrl+C" behavior, so the caller
//! decides when the process exits. Disposing the consumer removes the hook task, but tokio
//! keeps its process-wide signal handler installed: SIGINT no longer terminates the process
//! on its own even after every consumer is gone. Disable the hook with
//! [`ConsumerBuilder::dispose_on_signal`] when the application owns signal handling.
//!
//! ## Example
//!
//! ```ignore
//! use kafka_rest_client::{ConnectOptions, Consumer};
//!
//! let consumer = Consumer::builder().topic("orders").build()?;
//!
//! consumer
//!     .connect(
//!         ConnectOptions::new("order-audit", |message| {
//!             println!("{} @ {}: {}", message.topic, message.offset, message.value);
//!         })
//!         .on_error(|error| eprintln!("stream error: {}", error)),
//!     )
//!     .await?;
//!
//! // ... later
//! consumer.dispose().await;
//! ```

use crate::config::{ClientConfig, DEFAULT_RESET_SHUTDOWN_BUDGET};
use crate::connection::GatewayRegistry;
use crate::error::{ClientError, GatewayError, Result, StreamErrorKind};
use crate::gateway::{ConsumerInstance, Gateway, JoinOptions, Message};
use crate::shutdown::termination_signal;
use crate::stream::{MessageStream, StreamListener};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Callback invoked once per consumed message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback invoked with stream errors the consumer does not handle itself.
pub type ErrorHandler = Arc<dyn Fn(GatewayError) + Send + Sync>;

/// What to join and where to deliver messages.
#[derive(Clone)]
pub struct ConnectOptions {
    consumer_group: String,
    on_message: MessageHandler,
    on_error: Option<ErrorHandler>,
    join_options: JoinOptions,
}

impl ConnectOptions {
    /// Join `consumer_group` and pass every message to `on_message`.
    pub fn new<F>(consumer_group: impl Into<String>, on_message: F) -> Self
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        Self {
            consumer_group: consumer_group.into(),
            on_message: Arc::new(on_message),
            on_error: None,
            join_options: JoinOptions::default(),
        }
    }

    /// Receive stream errors other than topic-not-found and connection resets.
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(GatewayError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Override the join parameters (format, auto-commit, offset reset, poll interval).
    pub fn join_options(mut self, join_options: JoinOptions) -> Self {
        self.join_options = join_options;
        self
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("consumer_group", &self.consumer_group)
            .field("on_error", &self.on_error.is_some())
            .field("join_options", &self.join_options)
            .finish()
    }
}

/// Where a consumer is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumerState {
    /// Built, never connected.
    #[default]
    Idle,
    /// Joining the group and subscribing (including backoff between attempts).
    Connecting,
    /// A stream is attached and delivering messages.
    Connected,
    /// The stream was torn down; waiting before rejoining.
    Resetting,
    /// Terminal.
    Disposed,
}

/// Builder for [`Consumer`].
///
/// Only `topic` is required. The retry interval defaults to
/// `KAFKA_REST_CONSUMER_RETRY_MS` or 10 seconds, and the registry defaults to the
/// process-wide [`GatewayRegistry::global`].
pub struct ConsumerBuilder {
    topic: Option<String>,
    registry: Option<Arc<GatewayRegistry>>,
    retry_interval: Option<Duration>,
    reset_shutdown_budget: Duration,
    dispose_on_signal: bool,
    parent_span: Option<Span>,
}

impl ConsumerBuilder {
    pub fn new() -> Self {
        Self {
            topic: None,
            registry: None,
            retry_interval: None,
            reset_shutdown_budget: DEFAULT_RESET_SHUTDOWN_BUDGET,
            dispose_on_signal: true,
            parent_span: None,
        }
    }

    /// Topic to consume (required).
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Registry that supplies the gateway handle.
    pub fn registry(mut self, registry: Arc<GatewayRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Wait between failed joins, and before rejoining after a reset.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    /// Upper bound on the background shutdown of a group member during a reset.
    pub fn reset_shutdown_budget(mut self, budget: Duration) -> Self {
        self.reset_shutdown_budget = budget;
        self
    }

    /// Dispose the consumer on SIGINT/SIGTERM (default: true).
    ///
    /// Once installed, the process-wide handler outlives the consumer. A process relying on
    /// the default Ctrl+C exit must wait for the signal itself (e.g. `tokio::signal::ctrl_c`)
    /// and exit after disposing.
    pub fn dispose_on_signal(mut self, enabled: bool) -> Self {
        self.dispose_on_signal = enabled;
        self
    }

    /// Parent span for the consumer's `kafka.consumer` span.
    pub fn span(mut self, parent: Span) -> Self {
        self.parent_span = Some(parent);
        self
    }

    /// Build the consumer. Does not touch the network.
    ///
    /// # Errors
    ///
    /// - `Config` if no topic was given
    /// - `Config` if the retry interval falls back to a malformed environment variable
    pub fn build(self) -> Result<Consumer> {
        let topic = self
            .topic
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ClientError::Config("consumer topic is required".to_string()))?;

        let retry_interval = match self.retry_interval {
            Some(interval) => interval,
            None => ClientConfig::from_env()?.consumer_retry_interval,
        };
        let registry = self.registry.unwrap_or_else(GatewayRegistry::global);

        let span = match &self.parent_span {
            Some(parent) => info_span!(parent: parent, "kafka.consumer", topic = %topic),
            None => info_span!("kafka.consumer", topic = %topic),
        };

        let (cancel, _) = watch::channel(false);

        Ok(Consumer {
            inner: Arc::new(ConsumerInner {
                topic,
                retry_interval,
                reset_shutdown_budget: self.reset_shutdown_budget,
                dispose_on_signal: self.dispose_on_signal,
                registry,
                span,
                retries: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                cancel,
                shared: Mutex::new(Shared::default()),
            }),
        })
    }
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resilient single-topic consumer. See the [module docs](self).
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub fn builder() -> ConsumerBuilder {
        ConsumerBuilder::new()
    }

    /// Join the group, subscribe and start delivering messages.
    ///
    /// Resolves once a stream is attached, retrying failed joins every `retry_interval`
    /// for as long as it takes. Calling it on a connected consumer swaps in the new
    /// handlers and returns immediately.
    ///
    /// # Errors
    ///
    /// `Disposed` if the consumer is (or becomes, while connecting) disposed.
    pub async fn connect(&self, options: ConnectOptions) -> Result<()> {
        let inner = &self.inner;
        {
            let mut shared = inner.lock();
            if inner.is_disposed() {
                return Err(ClientError::Disposed);
            }
            shared.options = Some(options);
            if shared.stream.is_some() {
                debug!(parent: &inner.span, "Consumer already connected, handlers updated");
                return Ok(());
            }
        }

        inner.connect_loop().instrument(inner.span.clone()).await
    }

    /// Tear the consumer down. Safe to call any number of times.
    ///
    /// The first call cancels pending reconnects, detaches the stream, waits for the
    /// gateway to release the group member and drops every handler. Later calls return
    /// immediately.
    pub async fn dispose(&self) {
        let inner = Arc::clone(&self.inner);
        inner.dispose().instrument(self.inner.span.clone()).await
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Group of the current (or pending) connection.
    pub fn consumer_group(&self) -> Option<String> {
        self.inner
            .lock()
            .options
            .as_ref()
            .map(|o| o.consumer_group.clone())
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.lock().state
    }

    /// Failed joins since the last successful connect.
    pub fn connect_retries(&self) -> u64 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("topic", &self.inner.topic)
            .field("state", &self.state())
            .field("connect_retries", &self.connect_retries())
            .finish()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // Best effort: without an await point the group member can only be released in
        // the background, and only if a runtime is still around.
        let Some(teardown) = self.inner.begin_teardown() else {
            return;
        };
        if let Some(instance) = teardown.finish() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(
                    shutdown_within(instance, self.inner.reset_shutdown_budget)
                        .instrument(self.inner.span.clone()),
                );
            }
        }
        debug!(parent: &self.inner.span, "Consumer dropped without dispose");
    }
}

#[derive(Default)]
struct Shared {
    state: ConsumerState,
    gateway: Option<Arc<dyn Gateway>>,
    options: Option<ConnectOptions>,
    instance: Option<Arc<dyn ConsumerInstance>>,
    stream: Option<MessageStream>,
    /// Bumped on every attach so late events from a replaced stream are ignored.
    generation: u64,
    reset_task: Option<JoinHandle<()>>,
    signal_task: Option<JoinHandle<()>>,
}

struct ConsumerInner {
    topic: String,
    retry_interval: Duration,
    reset_shutdown_budget: Duration,
    dispose_on_signal: bool,
    registry: Arc<GatewayRegistry>,
    span: Span,
    retries: AtomicU64,
    disposed: AtomicBool,
    cancel: watch::Sender<bool>,
    shared: Mutex<Shared>,
}

/// Everything taken out of a consumer when it is disposed.
struct Teardown {
    stream: Option<MessageStream>,
    instance: Option<Arc<dyn ConsumerInstance>>,
    reset_task: Option<JoinHandle<()>>,
    signal_task: Option<JoinHandle<()>>,
}

impl Teardown {
    /// Stop timers and the stream; hand back the group member still to be shut down.
    fn finish(self) -> Option<Arc<dyn ConsumerInstance>> {
        if let Some(task) = self.reset_task {
            task.abort();
        }
        if let Some(task) = self.signal_task {
            task.abort();
        }
        if let Some(mut stream) = self.stream {
            stream.detach();
        }
        self.instance
    }
}

impl ConsumerInner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn connect_loop(self: &Arc<Self>) -> Result<()> {
        let mut cancel = self.cancel.subscribe();

        loop {
            let (gateway, options) = {
                let mut shared = self.lock();
                if self.is_disposed() {
                    return Err(ClientError::Disposed);
                }
                if shared.stream.is_some() {
                    return Ok(());
                }
                let Some(options) = shared.options.clone() else {
                    return Err(ClientError::Disposed);
                };
                let gateway = match &shared.gateway {
                    Some(gateway) => Arc::clone(gateway),
                    None => {
                        let (gateway, url) = self.registry.ensure();
                        debug!(url = %url, "Consumer bound to gateway");
                        shared.gateway = Some(Arc::clone(&gateway));
                        gateway
                    }
                };
                shared.state = ConsumerState::Connecting;
                (gateway, options)
            };

            match self.join_and_attach(&gateway, &options).await {
                Ok(()) => return Ok(()),
                Err(ClientError::Disposed) => return Err(ClientError::Disposed),
                Err(e) => {
                    let retry = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(
                        topic = %self.topic,
                        consumer_group = %options.consumer_group,
                        retry = retry,
                        retry_in_ms = self.retry_interval.as_millis() as u64,
                        error = %e,
                        "Failed to connect consumer"
                    );
                    if !sleep_unless_cancelled(&mut cancel, self.retry_interval).await {
                        return Err(ClientError::Disposed);
                    }
                }
            }
        }
    }

    async fn join_and_attach(
        self: &Arc<Self>,
        gateway: &Arc<dyn Gateway>,
        options: &ConnectOptions,
    ) -> Result<()> {
        let instance = gateway
            .join(&options.consumer_group, &options.join_options)
            .await?;

        let mut stream = match instance.subscribe(&self.topic).await {
            Ok(stream) => stream,
            Err(e) => {
                self.spawn_shutdown(instance);
                return Err(e.into());
            }
        };

        let mut shared = self.lock();
        if self.is_disposed() || shared.stream.is_some() {
            let disposed = self.is_disposed();
            drop(shared);
            stream.detach();
            self.spawn_shutdown(instance);
            return if disposed {
                Err(ClientError::Disposed)
            } else {
                Ok(())
            };
        }

        shared.generation += 1;
        let listener = Arc::new(ConsumerListener {
            inner: Arc::downgrade(self),
            generation: shared.generation,
        });
        if let Err(e) = stream.attach(listener) {
            drop(shared);
            self.spawn_shutdown(instance);
            return Err(e);
        }

        info!(
            topic = %self.topic,
            consumer_group = %options.consumer_group,
            instance_id = %instance.id(),
            "Consumer connected"
        );

        shared.stream = Some(stream);
        shared.instance = Some(instance);
        shared.state = ConsumerState::Connected;
        self.retries.store(0, Ordering::SeqCst);

        if self.dispose_on_signal && shared.signal_task.is_none() {
            shared.signal_task = Some(self.spawn_signal_hook());
        }
        Ok(())
    }

    fn handle_batch(&self, generation: u64, batch: Vec<Message>) {
        let handler = {
            let shared = self.lock();
            if shared.generation != generation || shared.stream.is_none() {
                return;
            }
            match &shared.options {
                Some(options) => Arc::clone(&options.on_message),
                None => return,
            }
        };

        for message in batch {
            handler(message);
        }
    }

    fn handle_stream_error(self: &Arc<Self>, generation: u64, error: GatewayError) {
        let _entered = self.span.enter();

        match error.classify() {
            StreamErrorKind::TopicNotFound => {
                info!(
                    topic = %self.topic,
                    retry_in_ms = self.retry_interval.as_millis() as u64,
                    "Topic not found, resetting consumer"
                );
                self.schedule_reset(generation);
            }
            StreamErrorKind::ConnectionReset => {
                warn!(
                    topic = %self.topic,
                    error = %error,
                    retry_in_ms = self.retry_interval.as_millis() as u64,
                    "Connection reset, resetting consumer"
                );
                self.schedule_reset(generation);
            }
            StreamErrorKind::Other => {
                let handler = {
                    let shared = self.lock();
                    if shared.generation != generation || shared.stream.is_none() {
                        return;
                    }
                    shared.options.as_ref().and_then(|o| o.on_error.clone())
                };
                match handler {
                    Some(handler) => handler(error),
                    None => warn!(
                        topic = %self.topic,
                        error = %error,
                        "Unhandled stream error (no on_error handler registered)"
                    ),
                }
            }
        }
    }

    /// Tear down the current stream and rejoin after `retry_interval`.
    ///
    /// Only the first error from a given stream resets it.
    fn schedule_reset(self: &Arc<Self>, generation: u64) {
        let (stream, instance) = {
            let mut shared = self.lock();
            if self.is_disposed()
                || shared.generation != generation
                || shared.state != ConsumerState::Connected
            {
                return;
            }
            shared.state = ConsumerState::Resetting;
            (shared.stream.take(), shared.instance.take())
        };

        if let Some(mut stream) = stream {
            stream.detach();
        }
        if let Some(instance) = instance {
            self.spawn_shutdown(instance);
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(
            async move {
                let mut cancel = inner.cancel.subscribe();
                if !sleep_unless_cancelled(&mut cancel, inner.retry_interval).await {
                    return;
                }
                debug!(topic = %inner.topic, "Reconnecting consumer");
                if let Err(e) = inner.connect_loop().await {
                    debug!(topic = %inner.topic, error = %e, "Reconnect abandoned");
                }
            }
            .instrument(self.span.clone()),
        );

        self.lock().reset_task = Some(task);
    }

    /// Release a group member in the background, giving up after the reset budget.
    fn spawn_shutdown(&self, instance: Arc<dyn ConsumerInstance>) {
        tokio::spawn(
            shutdown_within(instance, self.reset_shutdown_budget).instrument(self.span.clone()),
        );
    }

    fn spawn_signal_hook(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(
            async move {
                let signal = termination_signal().await;
                if let Some(inner) = inner.upgrade() {
                    info!(signal = %signal, topic = %inner.topic, "Disposing consumer on signal");
                    // dispose() aborts this task; run it on its own so it can not cancel itself.
                    let span = inner.span.clone();
                    tokio::spawn(async move { inner.dispose().await }.instrument(span));
                }
            }
            .instrument(self.span.clone()),
        )
    }

    /// Flip the disposed flag and take everything out. `None` if already disposed.
    fn begin_teardown(&self) -> Option<Teardown> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.cancel.send_replace(true);

        let mut shared = self.lock();
        shared.state = ConsumerState::Disposed;
        shared.options = None;
        shared.gateway = None;
        Some(Teardown {
            stream: shared.stream.take(),
            instance: shared.instance.take(),
            reset_task: shared.reset_task.take(),
            signal_task: shared.signal_task.take(),
        })
    }

    async fn dispose(self: Arc<Self>) {
        let Some(teardown) = self.begin_teardown() else {
            debug!(topic = %self.topic, "Consumer already disposed");
            return;
        };

        info!(topic = %self.topic, "Disposing consumer");
        if let Some(instance) = teardown.finish() {
            match instance.shutdown().await {
                Ok(()) => debug!(instance_id = %instance.id(), "Consumer instance shut down"),
                Err(e) => warn!(
                    instance_id = %instance.id(),
                    error = %e,
                    "Failed to shut down consumer instance"
                ),
            }
        }
        info!(topic = %self.topic, "Consumer disposed");
    }
}

struct ConsumerListener {
    inner: Weak<ConsumerInner>,
    generation: u64,
}

impl StreamListener for ConsumerListener {
    fn on_data(&self, batch: Vec<Message>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_batch(self.generation, batch);
        }
    }

    fn on_error(&self, error: GatewayError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_stream_error(self.generation, error);
        }
    }
}

async fn shutdown_within(instance: Arc<dyn ConsumerInstance>, budget: Duration) {
    match tokio::time::timeout(budget, instance.shutdown()).await {
        Ok(Ok(())) => debug!(instance_id = %instance.id(), "Consumer instance shut down"),
        Ok(Err(e)) => warn!(
            instance_id = %instance.id(),
            error = %e,
            "Failed to shut down consumer instance"
        ),
        Err(_) => warn!(
            instance_id = %instance.id(),
            budget_ms = budget.as_millis() as u64,
            "Consumer instance shutdown timed out"
        ),
    }
}

/// Sleep for `duration`. Returns `false` if cancelled first.
async fn sleep_unless_cancelled(cancel: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *cancel.borrow_and_update() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.wait_for(|cancelled| *cancelled) => false,
    }
}
