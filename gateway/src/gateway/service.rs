//! The request path shared by every frontend: admission, cache, dispatch.

use std::sync::Arc;

use streamgate_common::Usage;

use super::multiplexer::StreamMultiplexer;
use super::registry::BackendRegistry;
use super::task::{Completion, CompletionSource, GenerationHandle, GenerationRequest};
use crate::cache::{request_key, ResponseCache};
use crate::config::FallbackConfig;
use crate::error::GatewayError;
use crate::rate_limit::RateLimiter;

/// Fronts the multiplexer with rate limiting, the response cache and the
/// optional template fallback.
pub struct GatewayService {
    registry: Arc<BackendRegistry>,
    rate_limiter: Arc<RateLimiter>,
    cache: Arc<ResponseCache>,
    multiplexer: Arc<StreamMultiplexer>,
    fallback: FallbackConfig,
    default_max_tokens: u32,
}

impl GatewayService {
    pub fn new(
        registry: Arc<BackendRegistry>,
        rate_limiter: Arc<RateLimiter>,
        cache: Arc<ResponseCache>,
        multiplexer: Arc<StreamMultiplexer>,
        fallback: FallbackConfig,
        default_max_tokens: u32,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            cache,
            multiplexer,
            fallback,
            default_max_tokens,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn multiplexer(&self) -> &Arc<StreamMultiplexer> {
        &self.multiplexer
    }

    /// Run a generation to completion.
    ///
    /// Deterministic requests are answered from the cache when possible.
    pub async fn complete(&self, request: GenerationRequest) -> Result<Completion, GatewayError> {
        self.admit(&request)?;

        if self.cache.is_cacheable(request.temperature) {
            if let Some(entry) = self.cache.get(&request_key(&request)).await {
                tracing::debug!(
                    request_id = %request.request_id,
                    hits = entry.hit_count,
                    "Serving completion from cache"
                );
                return Ok(Completion {
                    content: entry.content,
                    finish_reason: entry.finish_reason,
                    usage: entry.usage,
                    source: CompletionSource::Cache,
                });
            }
        }

        match self.multiplexer.start(request.clone()).await {
            Ok(handle) => handle.collect().await,
            Err(GatewayError::NotAvailable(model)) if self.fallback.enabled => {
                Ok(self.fallback_completion(&request, &model))
            }
            Err(e) => Err(e),
        }
    }

    /// Start a streamed generation. Streams always reach a backend; cached
    /// answers are never replayed as a stream.
    pub async fn stream(&self, request: GenerationRequest) -> Result<GenerationHandle, GatewayError> {
        self.admit(&request)?;

        match self.multiplexer.start(request.clone()).await {
            Err(GatewayError::NotAvailable(model)) if self.fallback.enabled => {
                let completion = self.fallback_completion(&request, &model);
                Ok(GenerationHandle::ready(request.request_id, request.model, completion))
            }
            other => other,
        }
    }

    /// Cancel an in-flight generation by request id.
    pub fn cancel(&self, request_id: &str) -> Result<(), GatewayError> {
        if self.multiplexer.cancel(request_id) {
            Ok(())
        } else {
            Err(GatewayError::NotFound(format!("request '{}'", request_id)))
        }
    }

    fn admit(&self, request: &GenerationRequest) -> Result<(), GatewayError> {
        let estimate = request.estimated_tokens(self.default_max_tokens);
        self.rate_limiter.check(&request.client, estimate).map_err(|e| {
            tracing::info!(
                client = %request.client.id,
                tier = %request.client.tier,
                estimate,
                "Rejected by rate limiter"
            );
            e
        })
    }

    fn fallback_completion(&self, request: &GenerationRequest, model: &str) -> Completion {
        tracing::warn!(
            request_id = %request.request_id,
            "No backend for model {}, answering from fallback template",
            model
        );
        let content = self.fallback.template.replace("{model}", model);
        let completion_tokens = content.split_whitespace().count() as u32;
        Completion {
            content,
            finish_reason: "stop".to_string(),
            usage: Usage::new(request.estimated_prompt_tokens(), completion_tokens),
            source: CompletionSource::Fallback,
        }
    }
}
