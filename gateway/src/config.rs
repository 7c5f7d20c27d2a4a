//! Configuration for the gateway.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Statically configured backends, registered at startup.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub requests: RequestsConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A backend inference service instance.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    /// Base URL, e.g. `http://192.168.1.102:11434`.
    pub endpoint: String,
    /// Models served by this instance. Empty means "discover via /v1/models".
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Consecutive probe failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Unreachable instances older than this are deregistered.
    #[serde(default = "default_unreachable_ttl")]
    pub unreachable_ttl_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            probe_timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            unreachable_ttl_secs: default_unreachable_ttl(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Requests with a temperature above this are never cached.
    #[serde(default = "default_determinism_threshold")]
    pub determinism_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
            determinism_threshold: default_determinism_threshold(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(1))
    }
}

/// Token bucket parameters for one identity tier.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct TierConfig {
    /// Burst capacity in tokens.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<String, TierConfig>,
    /// Tier applied to clients without a recognised API key.
    #[serde(default = "default_tier_name")]
    pub default_tier: String,
    /// API keys and the tier each one unlocks.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

/// An API key mapped to a rate-limit tier.
///
/// Kept as a list rather than a table: config keys are case-folded, API keys
/// must not be.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub tier: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            default_tier: default_tier_name(),
            api_keys: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Buffered tokens per generation before the backend read blocks.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Silence from a backend longer than this fails the task as stalled.
    #[serde(default = "default_token_timeout")]
    pub token_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Retry stalled/overloaded generations once on another backend.
    #[serde(default = "default_true")]
    pub retry_transient: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            token_timeout_secs: default_token_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            retry_transient: true,
        }
    }
}

impl StreamingConfig {
    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestsConfig {
    /// `max_tokens` assumed when a request does not set one.
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: default_max_tokens(),
        }
    }
}

/// Template-based degraded response used when no backend is available.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `{model}` is replaced with the requested model name.
    #[serde(default = "default_fallback_template")]
    pub template: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            template: default_fallback_template(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_concurrent() -> u32 {
    4
}
fn default_health_interval() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    2
}
fn default_initial_backoff() -> u64 {
    30
}
fn default_max_backoff() -> u64 {
    300
}
fn default_unreachable_ttl() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}
fn default_cache_entries() -> usize {
    1000
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_determinism_threshold() -> f32 {
    0.2
}
fn default_tier_name() -> String {
    "anonymous".to_string()
}
fn default_tiers() -> HashMap<String, TierConfig> {
    HashMap::from([
        (
            "anonymous".to_string(),
            TierConfig {
                capacity: 4_000,
                refill_per_sec: 20.0,
            },
        ),
        (
            "authenticated".to_string(),
            TierConfig {
                capacity: 32_000,
                refill_per_sec: 200.0,
            },
        ),
    ])
}
fn default_channel_capacity() -> usize {
    64
}
fn default_token_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_max_tokens() -> u32 {
    512
}
fn default_fallback_template() -> String {
    "The model {model} is temporarily unavailable. Please try again shortly.".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY__SECTION__KEY format)
    /// 2. gateway.toml, or the file named by `GATEWAY_CONFIG` (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "gateway".to_string());
        Self::load_from(&path)
    }

    /// Load configuration using `path` as the optional config file.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port() as i64)?
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate_limit.tiers.contains_key(&self.rate_limit.default_tier) {
            return Err(ConfigError::Message(format!(
                "rate_limit.default_tier '{}' is not a configured tier",
                self.rate_limit.default_tier
            )));
        }
        for api_key in &self.rate_limit.api_keys {
            if !self.rate_limit.tiers.contains_key(&api_key.tier) {
                return Err(ConfigError::Message(format!(
                    "api key '{}...' references unknown tier '{}'",
                    api_key.key.chars().take(4).collect::<String>(),
                    api_key.tier
                )));
            }
        }
        for (name, tier) in &self.rate_limit.tiers {
            if tier.capacity == 0 || !(tier.refill_per_sec > 0.0 && tier.refill_per_sec.is_finite()) {
                return Err(ConfigError::Message(format!(
                    "rate limit tier '{}' needs a positive capacity and refill rate",
                    name
                )));
            }
        }
        for backend in &self.backends {
            if backend.max_concurrent_requests == 0 {
                return Err(ConfigError::Message(format!(
                    "backend '{}' must allow at least one concurrent request",
                    backend.id
                )));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            backends: vec![],
            health: HealthConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            streaming: StreamingConfig::default(),
            requests: RequestsConfig::default(),
            fallback: FallbackConfig::default(),
        }
    }
}
