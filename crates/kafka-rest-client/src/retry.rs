//! Fixed-interval retry for publish calls.
//!
//! ```text
//! ┌──────────────┐
//! │ produce(...) │ Producer API
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - max_retries: 3            │
//! │  - interval: 5s              │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: Immediate
//!        ├─→ Attempt 2: Wait 5s
//!        ├─→ Attempt 3: Wait 5s
//!        └─→ Attempt 4: Wait 5s, then give up with RetriesExhausted { attempts: 4 }
//! ```
//!
//! The delay does not grow between attempts. Gateway outages are expected to be short and
//! operators tune the interval directly.
//!
//! ## Attempt counting
//!
//! `max_retries = N` allows N retries after the first attempt, so at most `N + 1` calls.
//! The terminal error reports `attempts = N + 1`, the number of calls actually made.

use crate::config::{DEFAULT_PRODUCER_RETRY_INTERVAL, DEFAULT_PRODUCER_RETRY_TIMES};
use crate::error::{ClientError, GatewayError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Retry policy with a constant delay between attempts.
///
/// # Examples
///
/// ```ignore
/// // Default policy: 3 retries, 5s apart
/// let policy = RetryPolicy::default();
///
/// // Impatient caller
/// let policy = RetryPolicy::new(5, Duration::from_millis(300));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Wait between attempts
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_PRODUCER_RETRY_TIMES,
            interval: DEFAULT_PRODUCER_RETRY_INTERVAL,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
        }
    }

    /// Upper bound on calls made per operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Run `operation` until it succeeds or the policy is exhausted.
///
/// `operation` receives the 1-based attempt number. Every failure is logged with the topic
/// and attempt number before deciding whether to retry.
///
/// # Errors
///
/// `ClientError::RetriesExhausted` carrying the last gateway error, the topic and the number
/// of attempts made.
pub async fn retry_with_fixed_interval<F, Fut, T>(
    policy: &RetryPolicy,
    topic: &str,
    mut operation: F,
) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt: u32 = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(topic = topic, attempt = attempt, "Publish succeeded after retry");
                }
                return Ok(result);
            }
            Err(source) => {
                error!(
                    topic = topic,
                    attempt = attempt,
                    error = %source,
                    "Publish failed"
                );

                if attempt >= policy.max_attempts() {
                    error!(
                        topic = topic,
                        attempts = attempt,
                        max_retries = policy.max_retries,
                        "Max retries exceeded, giving up"
                    );
                    return Err(ClientError::RetriesExhausted {
                        topic: topic.to_string(),
                        attempts: attempt,
                        source,
                    });
                }

                warn!(
                    topic = topic,
                    attempt = attempt,
                    retry_in_ms = policy.interval.as_millis() as u64,
                    "Retrying publish"
                );
                sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}
