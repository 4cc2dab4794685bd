//! Error types for Kafka REST client operations.
//!
//! Errors are split in two layers:
//!
//! - [`GatewayError`]: what a single call against the REST Proxy produced (join, subscribe,
//!   poll, publish, shutdown). These are the errors a [`Gateway`](crate::Gateway)
//!   implementation returns and a [`MessageStream`](crate::MessageStream) emits.
//! - [`ClientError`]: what the [`Consumer`](crate::Consumer) and
//!   [`Producer`](crate::Producer) surface to callers once their retry policies have run.
//!
//! ## Error Handling Strategy
//!
//! - **Retried locally**: `Unreachable` (join and publish), `Http` on publish
//! - **Reset the stream**: `TopicNotFound`, `ConnectionReset`, `Closed` seen while consuming.
//!   The REST gateway reports an unreachable proxy or a lost consumer instance on an
//!   established stream as `ConnectionReset`.
//! - **Forwarded to the caller**: every other stream error
//! - **Terminal**: `RetriesExhausted`, `Config`, `Disposed`
//!
//! ## Examples
//!
//! ```ignore
//! use kafka_rest_client::{ClientError, Producer};
//!
//! match producer.produce(json!({"foo": "bar"})).await {
//!     Ok(result) => println!("Published: {:?}", result),
//!     Err(ClientError::RetriesExhausted { topic, attempts, source }) => {
//!         eprintln!("Gave up on '{}' after {} attempts: {}", topic, attempts, source);
//!     }
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// REST Proxy error code for an unknown topic.
pub const ERROR_CODE_TOPIC_NOT_FOUND: i32 = 40401;

/// REST Proxy error code for an unknown consumer instance.
pub const ERROR_CODE_CONSUMER_INSTANCE_NOT_FOUND: i32 = 40403;

/// Error produced by a call against the broker gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The gateway could not be reached at all (connection refused, DNS, timeout).
    ///
    /// ## Causes
    /// - REST Proxy is down or restarting
    /// - Wrong gateway URL
    /// - Network partition
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The topic does not exist (yet) on the broker.
    ///
    /// Consumers commonly see this when they subscribe before the first record has been
    /// published, since topics are auto-created on first produce.
    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    /// The transport dropped an established connection.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The gateway answered with a non-success status.
    ///
    /// `error_code` is the REST Proxy's own error code from the response body, when present.
    #[error("gateway returned HTTP {status} (error_code: {error_code:?}): {message}")]
    Http {
        status: u16,
        error_code: Option<i32>,
        message: String,
    },

    /// The gateway answered but the body could not be decoded.
    #[error("failed to decode gateway response: {0}")]
    Decode(String),

    /// The stream stopped delivering: the session was closed from the other side, or the
    /// listener could not handle a batch.
    #[error("stream closed: {0}")]
    Closed(String),
}

/// How a consumer reacts to an error emitted by its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Topic is missing; tear the stream down and rejoin.
    TopicNotFound,
    /// Transport dropped or the stream closed; tear the stream down and rejoin.
    ConnectionReset,
    /// Anything else; hand it to the caller.
    Other,
}

impl GatewayError {
    /// Classify an error seen on a message stream.
    pub fn classify(&self) -> StreamErrorKind {
        match self {
            GatewayError::TopicNotFound(_) => StreamErrorKind::TopicNotFound,
            GatewayError::Http {
                error_code: Some(ERROR_CODE_TOPIC_NOT_FOUND),
                ..
            } => StreamErrorKind::TopicNotFound,
            GatewayError::ConnectionReset(_) | GatewayError::Closed(_) => {
                StreamErrorKind::ConnectionReset
            }
            _ => StreamErrorKind::Other,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        // Walk the source chain: hyper wraps the io error a few levels down.
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
        while let Some(e) = source {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                if matches!(
                    io_err.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::BrokenPipe
                ) {
                    return GatewayError::ConnectionReset(err.to_string());
                }
            }
            source = e.source();
        }

        if err.is_connect() || err.is_timeout() {
            GatewayError::Unreachable(err.to_string())
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            GatewayError::Http {
                status: status.as_u16(),
                error_code: None,
                message: err.to_string(),
            }
        } else {
            GatewayError::Unreachable(err.to_string())
        }
    }
}

/// Error surfaced by the [`Consumer`](crate::Consumer) and [`Producer`](crate::Producer).
#[derive(Debug, Error)]
pub enum ClientError {
    /// A gateway call failed and was not retried.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The producer ran out of retries.
    ///
    /// `attempts` is the total number of publish attempts made, i.e. `retry_times + 1`.
    #[error("max retries exceeded for topic '{topic}' after {attempts} attempts: {source}")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    /// Invalid client configuration (missing topic, unparsable schema, bad env value).
    #[error("configuration error: {0}")]
    Config(String),

    /// The consumer was disposed; it can not be used any more.
    #[error("consumer has been disposed")]
    Disposed,

    /// A listener is already attached to this stream.
    #[error("a listener is already attached to the stream for topic '{0}'")]
    AlreadyAttached(String),

    /// The stream was detached; its events are gone.
    #[error("the stream for topic '{0}' has been detached")]
    StreamDetached(String),
}

impl ClientError {
    /// Number of publish attempts carried by a terminal producer error.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ClientError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
