pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod llm;
pub mod logging;
pub mod rate_limit;
pub mod routes;
pub mod test_util;

pub use cache::ResponseCache;
pub use config::Config;
pub use error::GatewayError;
pub use gateway::{
    BackendRegistry, GatewayService, HealthMonitor, HealthPolicy, MultiplexerConfig, Selector,
    StreamMultiplexer,
};
pub use identity::{ClientIdentity, IdentityResolver};
pub use llm::{BackendClient, HttpBackendClient};
pub use rate_limit::RateLimiter;

use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Backend registry, seeded from config and kept current by the health monitor.
    pub registry: Arc<BackendRegistry>,
    pub cache: Arc<ResponseCache>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Request path shared by the HTTP and WebSocket frontends.
    pub service: Arc<GatewayService>,
    pub identities: IdentityResolver,
}

impl AppState {
    /// Wire every component from `config`, talking to backends through `client`.
    pub async fn new(config: Config, client: Arc<dyn BackendClient>) -> Self {
        let registry = Arc::new(BackendRegistry::from_config(&config.backends).await);
        let cache = Arc::new(ResponseCache::new(&config.cache));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let multiplexer = Arc::new(StreamMultiplexer::new(
            Selector::new(registry.clone()),
            client,
            cache.clone(),
            MultiplexerConfig::from(&config.streaming),
        ));
        let service = Arc::new(GatewayService::new(
            registry.clone(),
            rate_limiter.clone(),
            cache.clone(),
            multiplexer,
            config.fallback.clone(),
            config.requests.default_max_tokens,
        ));
        let identities = IdentityResolver::new(&config.rate_limit);

        Self {
            config,
            registry,
            cache,
            rate_limiter,
            service,
            identities,
        }
    }
}
