use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::analytics::{AnalyticsSink, StoreSink};
use crate::api::IdentityResolver;
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::storage::open_store;
use crate::transport::{AgentRuntime, HttpRuntimeClient};

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub runtime: Arc<dyn AgentRuntime>,
    pub sink: Arc<dyn AnalyticsSink>,
    identity: IdentityResolver,
    request_ids: RequestIdGenerator,
}

impl AppState {
    /// Assemble state from already-built collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the identity headers are invalid.
    pub fn new(
        config: AppConfig,
        runtime: Arc<dyn AgentRuntime>,
        sink: Arc<dyn AnalyticsSink>,
    ) -> Result<Self, GatewayError> {
        let identity = IdentityResolver::from_config(&config.auth)?;
        Ok(Self {
            config,
            runtime,
            sink,
            identity,
            request_ids: RequestIdGenerator::new(),
        })
    }

    /// Build the HTTP runtime client and the configured record store.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] or [`GatewayError::Transport`] when a
    /// collaborator cannot be built.
    pub fn from_config(config: AppConfig) -> Result<Self, GatewayError> {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(HttpRuntimeClient::new(&config.runtime)?);
        let store = open_store(&config.storage)
            .map_err(|err| GatewayError::Config(err.to_string()))?;
        let sink: Arc<dyn AnalyticsSink> = Arc::new(StoreSink::new(store, &config.storage));
        Self::new(config, runtime, sink)
    }

    #[must_use]
    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    /// Fresh request id for logs.
    #[must_use]
    pub fn next_request_id(&self) -> String {
        self.request_ids.next_id().to_string()
    }
}

/// Per-process random seed mixed with a counter; unique without a syscall
/// per request.
struct RequestIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> uuid::Uuid {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        uuid::Uuid::from_u128(self.seed ^ u128::from(seq))
    }
}
