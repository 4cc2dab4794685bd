//! Client configuration.
//!
//! Every setting has a built-in default and can be overridden from the environment:
//!
//! | Variable                           | Default                  |
//! |------------------------------------|--------------------------|
//! | `KAFKA_REST_PROXY_URL`             | `http://127.0.0.1:8082`  |
//! | `KAFKA_REST_CONSUMER_RETRY_MS`     | `10000`                  |
//! | `KAFKA_REST_PRODUCER_RETRY_MS`     | `5000`                   |
//! | `KAFKA_REST_PRODUCER_RETRY_TIMES`  | `3`                      |
//!
//! Builder settings on [`Consumer`](crate::Consumer) and [`Producer`](crate::Producer)
//! take precedence over both.

use crate::error::{ClientError, Result};
use std::time::Duration;

/// Environment variable holding the REST Proxy base URL.
pub const GATEWAY_URL_ENV: &str = "KAFKA_REST_PROXY_URL";

/// Gateway URL used when neither an override nor the environment provide one.
pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:8082";

/// Default wait between consumer join attempts and after a stream reset.
pub const DEFAULT_CONSUMER_RETRY_INTERVAL: Duration = Duration::from_millis(10_000);

/// Default wait between publish attempts.
pub const DEFAULT_PRODUCER_RETRY_INTERVAL: Duration = Duration::from_millis(5_000);

/// Default number of publish retries after the first attempt.
pub const DEFAULT_PRODUCER_RETRY_TIMES: u32 = 3;

/// Default budget for the background shutdown issued on stream reset.
pub const DEFAULT_RESET_SHUTDOWN_BUDGET: Duration = Duration::from_secs(1);

/// Resolved client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Gateway URL from the environment, if set. The registry applies its own override
    /// and default on top of this.
    pub gateway_url: Option<String>,
    pub consumer_retry_interval: Duration,
    pub producer_retry_interval: Duration,
    pub producer_retry_times: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: None,
            consumer_retry_interval: DEFAULT_CONSUMER_RETRY_INTERVAL,
            producer_retry_interval: DEFAULT_PRODUCER_RETRY_INTERVAL,
            producer_retry_times: DEFAULT_PRODUCER_RETRY_TIMES,
        }
    }
}

impl ClientConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if a numeric variable is set but does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let gateway_url = lookup(GATEWAY_URL_ENV).filter(|url| !url.trim().is_empty());

        let consumer_retry_interval = parse_millis(&lookup, "KAFKA_REST_CONSUMER_RETRY_MS")?
            .unwrap_or(defaults.consumer_retry_interval);
        let producer_retry_interval = parse_millis(&lookup, "KAFKA_REST_PRODUCER_RETRY_MS")?
            .unwrap_or(defaults.producer_retry_interval);
        let producer_retry_times = match lookup("KAFKA_REST_PRODUCER_RETRY_TIMES") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|e| {
                ClientError::Config(format!(
                    "KAFKA_REST_PRODUCER_RETRY_TIMES must be a non-negative integer, got '{}': {}",
                    raw, e
                ))
            })?,
            None => defaults.producer_retry_times,
        };

        Ok(Self {
            gateway_url,
            consumer_retry_interval,
            producer_retry_interval,
            producer_retry_times,
        })
    }

    /// Resolve the effective gateway URL: override > environment > default.
    pub fn resolve_gateway_url(&self, url_override: Option<&str>) -> String {
        url_override
            .map(str::to_string)
            .or_else(|| self.gateway_url.clone())
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string())
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|e| {
                ClientError::Config(format!(
                    "{} must be a duration in milliseconds, got '{}': {}",
                    key, raw, e
                ))
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.consumer_retry_interval, Duration::from_secs(10));
        assert_eq!(config.producer_retry_interval, Duration::from_secs(5));
        assert_eq!(config.producer_retry_times, 3);
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("KAFKA_REST_PROXY_URL", "http://proxy:8082"),
            ("KAFKA_REST_CONSUMER_RETRY_MS", "250"),
            ("KAFKA_REST_PRODUCER_RETRY_MS", "100"),
            ("KAFKA_REST_PRODUCER_RETRY_TIMES", "7"),
        ]))
        .unwrap();

        assert_eq!(config.gateway_url.as_deref(), Some("http://proxy:8082"));
        assert_eq!(config.consumer_retry_interval, Duration::from_millis(250));
        assert_eq!(config.producer_retry_interval, Duration::from_millis(100));
        assert_eq!(config.producer_retry_times, 7);
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = ClientConfig::from_lookup(lookup_from(&[(
            "KAFKA_REST_PRODUCER_RETRY_TIMES",
            "lots",
        )]))
        .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));

        let err = ClientConfig::from_lookup(lookup_from(&[("KAFKA_REST_CONSUMER_RETRY_MS", "-1")]))
            .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_url_resolution_order() {
        let config = ClientConfig::default();
        assert_eq!(config.resolve_gateway_url(None), DEFAULT_GATEWAY_URL);

        let config = ClientConfig {
            gateway_url: Some("http://env:8082".to_string()),
            ..ClientConfig::default()
        };
        assert_eq!(config.resolve_gateway_url(None), "http://env:8082");
        assert_eq!(
            config.resolve_gateway_url(Some("http://override:8082")),
            "http://override:8082"
        );
    }

    #[test]
    fn test_empty_env_url_ignored() {
        let config =
            ClientConfig::from_lookup(lookup_from(&[("KAFKA_REST_PROXY_URL", "  ")])).unwrap();
        assert_eq!(config.gateway_url, None);
    }
}
