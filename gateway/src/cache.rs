//! In-memory response cache for deterministic completions.
//!
//! Entries are keyed by a SHA-256 digest of the normalized request and
//! evicted by TTL or, once the cache is full, least-recently-used first.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use streamgate_common::{ChatMessage, Usage};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CacheConfig;
use crate::gateway::GenerationRequest;

/// A cached completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub hit_count: u64,
    expires_at: Instant,
}

impl CacheEntry {
    pub fn new(content: String, finish_reason: String, usage: Usage) -> Self {
        Self {
            content,
            finish_reason,
            usage,
            created_at: Utc::now(),
            hit_count: 0,
            expires_at: Instant::now(),
        }
    }

    /// Completion tokens of the cached answer.
    pub fn token_count(&self) -> u32 {
        self.usage.completion_tokens
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Serialize)]
struct NormalizedMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct NormalizedRequest<'a> {
    model: &'a str,
    messages: Vec<NormalizedMessage<'a>>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

/// Cache key for (model, messages, temperature, max_tokens). Runs of
/// whitespace in message content are collapsed before hashing.
pub fn cache_key(
    model: &str,
    messages: &[ChatMessage],
    temperature: Option<f32>,
    max_tokens: Option<u32>,
) -> String {
    let normalized = NormalizedRequest {
        model,
        messages: messages
            .iter()
            .map(|m| NormalizedMessage {
                role: &m.role,
                content: m.content.split_whitespace().collect::<Vec<_>>().join(" "),
            })
            .collect(),
        temperature,
        max_tokens,
    };
    // Serializing plain strings and numbers cannot fail.
    let bytes = serde_json::to_vec(&normalized).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Cache key of a generation request.
pub fn request_key(request: &GenerationRequest) -> String {
    cache_key(
        &request.model,
        &request.messages,
        request.temperature,
        request.max_tokens,
    )
}

/// LRU + TTL response cache.
pub struct ResponseCache {
    entries: RwLock<LruCache<String, CacheEntry>>,
    ttl: Duration,
    determinism_threshold: f32,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            ttl: config.ttl(),
            determinism_threshold: config.determinism_threshold,
            enabled: config.enabled,
        }
    }

    /// Create a cache with an explicit TTL.
    pub fn with_ttl(config: &CacheConfig, ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::new(config)
        }
    }

    /// Whether a request at `temperature` may be cached. An unset
    /// temperature means the backend default, which is not deterministic.
    pub fn is_cacheable(&self, temperature: Option<f32>) -> bool {
        self.enabled
            && temperature
                .map(|t| t <= self.determinism_threshold)
                .unwrap_or(false)
    }

    /// Look up `key`. A hit refreshes the TTL, promotes the entry and
    /// increments its hit count; an expired entry is purged.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let expired = self.entries.read().await.peek(key).map(|e| e.is_expired(now));
        match expired {
            None => return None,
            Some(false) => {}
            Some(true) => {
                self.entries.write().await.pop(key);
                tracing::debug!("Cache entry {} expired", &key[..key.len().min(12)]);
                return None;
            }
        }

        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key)?;
        // Re-check: the entry may have expired between the two locks.
        if entry.is_expired(now) {
            entries.pop(key);
            return None;
        }
        entry.hit_count += 1;
        entry.expires_at = now + self.ttl;
        Some(entry.clone())
    }

    /// Store `entry` under `key`, evicting the least recently used entry
    /// when full.
    pub async fn put(&self, key: String, mut entry: CacheEntry) {
        if !self.enabled {
            return;
        }
        entry.expires_at = Instant::now() + self.ttl;
        if let Some((evicted, _)) = self.entries.write().await.push(key.clone(), entry) {
            if evicted != key {
                tracing::debug!("Cache full, evicted {}", &evicted[..evicted.len().min(12)]);
            }
        }
    }

    /// Remove all expired entries. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Sweep every TTL/4 until `shutdown` is cancelled.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = (self.ttl / 4).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.sweep().await;
                        if removed > 0 {
                            tracing::debug!("Cache sweep removed {} expired entries", removed);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            ..CacheConfig::default()
        }
    }

    fn entry(content: &str) -> CacheEntry {
        CacheEntry::new(content.to_string(), "stop".to_string(), Usage::new(3, 2))
    }

    fn key(content: &str) -> String {
        cache_key("m", &[ChatMessage::user(content)], Some(0.0), Some(64))
    }

    #[test]
    fn test_key_normalizes_whitespace() {
        assert_eq!(key("hello   world"), key(" hello\n\tworld "));
        assert_ne!(key("hello world"), key("hello world!"));
    }

    #[test]
    fn test_key_covers_all_parameters() {
        let messages = [ChatMessage::user("hi")];
        let base = cache_key("m", &messages, Some(0.0), Some(64));
        assert_ne!(base, cache_key("n", &messages, Some(0.0), Some(64)));
        assert_ne!(base, cache_key("m", &messages, Some(0.1), Some(64)));
        assert_ne!(base, cache_key("m", &messages, Some(0.0), Some(65)));
        assert_ne!(base, cache_key("m", &[ChatMessage::assistant("hi")], Some(0.0), Some(64)));
    }

    #[test]
    fn test_cacheable_threshold() {
        let cache = ResponseCache::new(&config(10));
        assert!(cache.is_cacheable(Some(0.0)));
        assert!(cache.is_cacheable(Some(0.2)));
        assert!(!cache.is_cacheable(Some(0.7)));
        assert!(!cache.is_cacheable(None));

        let disabled = ResponseCache::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        assert!(!disabled.is_cacheable(Some(0.0)));
    }

    #[tokio::test]
    async fn test_hit_increments_count() {
        let cache = ResponseCache::new(&config(10));
        cache.put(key("a"), entry("answer")).await;

        let first = cache.get(&key("a")).await.unwrap();
        let second = cache.get(&key("a")).await.unwrap();
        assert_eq!(first.hit_count, 1);
        assert_eq!(second.hit_count, 2);
        assert_eq!(second.content, "answer");
        assert_eq!(second.token_count(), 2);
        assert!(cache.get(&key("b")).await.is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = ResponseCache::new(&config(2));
        cache.put(key("a"), entry("a")).await;
        cache.put(key("b"), entry("b")).await;
        // Touch a so b becomes least recently used.
        cache.get(&key("a")).await.unwrap();
        cache.put(key("c"), entry("c")).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&key("b")).await.is_none());
        assert!(cache.get(&key("a")).await.is_some());
        assert!(cache.get(&key("c")).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_entries_purged_lazily() {
        let cache = ResponseCache::with_ttl(&config(10), Duration::from_millis(30));
        cache.put(key("a"), entry("a")).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(cache.get(&key("a")).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_hit_refreshes_ttl() {
        let cache = ResponseCache::with_ttl(&config(10), Duration::from_millis(100));
        cache.put(key("a"), entry("a")).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(cache.get(&key("a")).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let cache = ResponseCache::with_ttl(&config(10), Duration::from_millis(30));
        cache.put(key("a"), entry("a")).await;
        cache.put(key("b"), entry("b")).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.sweep().await, 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let cache = Arc::new(ResponseCache::with_ttl(&config(10), Duration::from_millis(40)));
        let shutdown = CancellationToken::new();
        let handle = cache.clone().spawn_sweeper(shutdown.clone());

        cache.put(key("a"), entry("a")).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.is_empty().await);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
