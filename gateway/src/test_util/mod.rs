pub mod mock_backend;

pub use mock_backend::{MockBackend, MockStep};

use std::sync::Arc;

use crate::config::{ApiKeyConfig, BackendConfig, Config};
use crate::AppState;

pub const TEST_API_KEY: &str = "sk-test-key";

/// Config with one backend per `(id, endpoint)` serving model "m", and
/// [`TEST_API_KEY`] mapped to the "authenticated" tier.
pub fn test_config(backends: &[(&str, &str)]) -> Config {
    let mut config = Config::default();
    config.logging.level = "debug".to_string();
    config.backends = backends
        .iter()
        .map(|(id, endpoint)| BackendConfig {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            models: vec!["m".to_string()],
            max_concurrent_requests: 4,
        })
        .collect();
    config.rate_limit.api_keys.push(ApiKeyConfig {
        key: TEST_API_KEY.to_string(),
        tier: "authenticated".to_string(),
    });
    config.streaming.token_timeout_secs = 2;
    config
}

/// Application state backed by a [`MockBackend`].
pub async fn create_test_state(config: Config) -> (Arc<AppState>, Arc<MockBackend>) {
    let mock = Arc::new(MockBackend::new());
    let state = AppState::new(config, mock.clone()).await;
    (Arc::new(state), mock)
}

/// An OpenAI-style SSE body streaming `tokens`, terminated by `[DONE]`.
pub fn sse_chat_body(tokens: &[&str]) -> String {
    let mut body = String::new();
    for token in tokens {
        let chunk = serde_json::json!({
            "id": "chatcmpl-test",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": token}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {}\n\n", chunk));
    }
    let last = serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 5, "completion_tokens": tokens.len(), "total_tokens": 5 + tokens.len()}
    });
    body.push_str(&format!("data: {}\n\n", last));
    body.push_str("data: [DONE]\n\n");
    body
}
