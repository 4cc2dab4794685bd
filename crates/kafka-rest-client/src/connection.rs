//! Shared gateway handle.
//!
//! All consumers and producers built from the same [`GatewayRegistry`] share one
//! [`Gateway`] handle (and therefore one HTTP connection pool). The handle is created on
//! first use and memoized until [`GatewayRegistry::reset`] is called.
//!
//! ## URL resolution
//!
//! 1. Explicit override ([`GatewayRegistry::set_url_override`] / [`set_gateway_url`])
//! 2. `KAFKA_REST_PROXY_URL` environment variable
//! 3. `http://127.0.0.1:8082`
//!
//! The URL is resolved when the handle is created. Changing the override afterwards has no
//! effect until the next [`reset`](GatewayRegistry::reset).
//!
//! ## Thread Safety
//!
//! GatewayRegistry is Send + Sync. Creating the handle is synchronous and cheap, so a plain
//! mutex guards it. Consumers and producers capture the `Arc` they were given; a reset does
//! not reach them.
//!
//! ## Examples
//!
//! ```ignore
//! use kafka_rest_client::GatewayRegistry;
//!
//! let registry = GatewayRegistry::global();
//! registry.set_url_override(Some("http://proxy:8082".to_string()));
//! let (gateway, url) = registry.ensure();
//! ```

use crate::config::{ClientConfig, GATEWAY_URL_ENV};
use crate::gateway::Gateway;
use crate::rest::RestGateway;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{debug, info};

/// Builds a gateway handle for a base URL.
pub trait GatewayFactory: Send + Sync {
    fn create(&self, url: &str) -> Arc<dyn Gateway>;
}

impl<F> GatewayFactory for F
where
    F: Fn(&str) -> Arc<dyn Gateway> + Send + Sync,
{
    fn create(&self, url: &str) -> Arc<dyn Gateway> {
        self(url)
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    url_override: Option<String>,
    handle: Option<(Arc<dyn Gateway>, String)>,
}

/// Lazily created, memoized gateway handle.
pub struct GatewayRegistry {
    state: Mutex<RegistryState>,
    factory: Arc<dyn GatewayFactory>,
    env: EnvLookup,
}

static GLOBAL: OnceLock<Arc<GatewayRegistry>> = OnceLock::new();

impl GatewayRegistry {
    /// Registry that builds [`RestGateway`] handles.
    pub fn new() -> Self {
        Self::with_factory(|url: &str| Arc::new(RestGateway::new(url)) as Arc<dyn Gateway>)
    }

    /// Registry with a custom handle factory (in-memory gateways, instrumented clients).
    pub fn with_factory(factory: impl GatewayFactory + 'static) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            factory: Arc::new(factory),
            env: Arc::new(|key: &str| std::env::var(key).ok()),
        }
    }

    /// Replace the environment lookup used for `KAFKA_REST_PROXY_URL`.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    /// Process-wide registry used by builders when none is supplied.
    pub fn global() -> Arc<GatewayRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(GatewayRegistry::new())))
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set or clear the explicit URL override.
    pub fn set_url_override(&self, url: Option<String>) {
        let mut state = self.lock();
        debug!(url = ?url, "Gateway URL override updated");
        state.url_override = url;
    }

    /// URL a new handle would be created with right now.
    pub fn effective_url(&self) -> String {
        let url_override = self.lock().url_override.clone();
        self.resolve(url_override.as_deref())
    }

    fn resolve(&self, url_override: Option<&str>) -> String {
        let config = ClientConfig {
            gateway_url: (self.env)(GATEWAY_URL_ENV).filter(|url| !url.trim().is_empty()),
            ..ClientConfig::default()
        };
        config.resolve_gateway_url(url_override)
    }

    /// Return the shared handle, creating it on first use.
    ///
    /// Repeated calls return the same handle and URL without side effects.
    pub fn ensure(&self) -> (Arc<dyn Gateway>, String) {
        let mut state = self.lock();
        if let Some((gateway, url)) = &state.handle {
            return (Arc::clone(gateway), url.clone());
        }

        let url = self.resolve(state.url_override.as_deref());
        let gateway = self.factory.create(&url);
        info!(url = %url, "Created gateway handle");
        state.handle = Some((Arc::clone(&gateway), url.clone()));
        (gateway, url)
    }

    /// The memoized handle, if one exists.
    pub fn current(&self) -> Option<Arc<dyn Gateway>> {
        self.lock().handle.as_ref().map(|(gateway, _)| Arc::clone(gateway))
    }

    /// Drop the memoized handle. The next [`ensure`](Self::ensure) creates a new one.
    pub fn reset(&self) {
        let mut state = self.lock();
        if let Some((_, url)) = state.handle.take() {
            info!(url = %url, "Gateway handle reset");
        }
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Set the gateway URL override on the process-wide registry.
pub fn set_gateway_url(url: impl Into<String>) {
    GatewayRegistry::global().set_url_override(Some(url.into()));
}

/// Clear the gateway URL override on the process-wide registry.
pub fn clear_gateway_url() {
    GatewayRegistry::global().set_url_override(None);
}
