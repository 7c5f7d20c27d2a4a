//! Client identity resolution for rate limiting.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::http::{header, HeaderMap};
use sha2::{Digest, Sha256};

use crate::config::RateLimitConfig;

/// Who a request is charged to, and under which tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    /// Stable key, `key:<hash prefix>` or `ip:<address>`.
    pub id: String,
    pub tier: String,
}

impl ClientIdentity {
    pub fn new(id: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: tier.into(),
        }
    }
}

/// Maps API keys and peer addresses to identities.
///
/// Keys are held only as SHA-256 digests.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    keys: HashMap<String, String>,
    default_tier: String,
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

impl IdentityResolver {
    pub fn new(config: &RateLimitConfig) -> Self {
        let keys = config
            .api_keys
            .iter()
            .map(|k| (hash_key(&k.key), k.tier.clone()))
            .collect();
        Self {
            keys,
            default_tier: config.default_tier.clone(),
        }
    }

    /// Identity for a presented API key, if the key is known.
    pub fn from_api_key(&self, key: &str) -> Option<ClientIdentity> {
        let digest = hash_key(key.trim());
        self.keys
            .get(&digest)
            .map(|tier| ClientIdentity::new(format!("key:{}", &digest[..16]), tier.clone()))
    }

    /// Identity for an unauthenticated peer.
    pub fn anonymous(&self, addr: Option<SocketAddr>) -> ClientIdentity {
        let id = match addr {
            Some(addr) => format!("ip:{}", addr.ip()),
            None => "ip:unknown".to_string(),
        };
        ClientIdentity::new(id, self.default_tier.clone())
    }

    /// Resolve from an `Authorization: Bearer` header, falling back to the
    /// peer address. Unknown keys are treated as anonymous.
    pub fn resolve(&self, headers: &HeaderMap, addr: Option<SocketAddr>) -> ClientIdentity {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .and_then(|key| self.from_api_key(key))
            .unwrap_or_else(|| self.anonymous(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyConfig;
    use axum::http::HeaderValue;

    fn resolver() -> IdentityResolver {
        let mut config = RateLimitConfig::default();
        config.api_keys.push(ApiKeyConfig {
            key: "sk-test".to_string(),
            tier: "authenticated".to_string(),
        });
        IdentityResolver::new(&config)
    }

    #[test]
    fn test_known_key_maps_to_tier() {
        let identity = resolver().from_api_key("sk-test").unwrap();
        assert_eq!(identity.tier, "authenticated");
        assert!(identity.id.starts_with("key:"));
        assert!(!identity.id.contains("sk-test"));
        assert!(resolver().from_api_key("sk-other").is_none());
    }

    #[test]
    fn test_resolve_prefers_bearer_key() {
        let addr: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer sk-test"));

        let identity = resolver().resolve(&headers, Some(addr));
        assert_eq!(identity.tier, "authenticated");
    }

    #[test]
    fn test_resolve_falls_back_to_address() {
        let addr: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));

        let identity = resolver().resolve(&headers, Some(addr));
        assert_eq!(identity, ClientIdentity::new("ip:10.0.0.5", "anonymous"));
        assert_eq!(resolver().anonymous(None).id, "ip:unknown");
    }
}
