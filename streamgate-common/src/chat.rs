//! OpenAI-compatible chat completion types.
//!
//! The same shapes are spoken on both sides of the gateway: clients send them
//! to streamgate, and streamgate forwards them to backends.

use serde::{Deserialize, Serialize};

/// OpenAI-compatible chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Whether to stream the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// OpenAI-compatible chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Set to `"fallback"` when the content came from the configured template
    /// instead of a backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl ChatCompletionResponse {
    pub fn new(model: String, message: ChatMessage, finish_reason: Option<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: now,
            model,
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason,
            }],
            usage: None,
            system_fingerprint: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// One `data:` payload of a streamed chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_chunk_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

fn default_chunk_object() -> String {
    "chat.completion.chunk".to_string()
}

impl ChatCompletionChunk {
    /// A chunk carrying one piece of assistant content.
    pub fn token(id: &str, model: &str, content: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            object: default_chunk_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(content.into()),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// The final chunk: empty delta, a finish reason and usage totals.
    pub fn finish(id: &str, model: &str, finish_reason: &str, usage: Usage) -> Self {
        Self {
            id: id.to_string(),
            object: default_chunk_object(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta::default(),
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage: Some(usage),
        }
    }

    /// Concatenated delta content across choices.
    pub fn content(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .choices
            .iter()
            .filter_map(|c| c.delta.content.as_deref())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.concat())
        }
    }

    /// First finish reason reported by any choice.
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .iter()
            .find_map(|c| c.finish_reason.as_deref())
    }
}

/// Model entry in a `/v1/models` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    #[serde(default = "default_model_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default = "default_owned_by")]
    pub owned_by: String,
}

impl ModelObject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: default_model_object(),
            created: 0,
            owned_by: default_owned_by(),
        }
    }
}

/// Response body of `/v1/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    #[serde(default = "default_list_object")]
    pub object: String,
    pub data: Vec<ModelObject>,
}

impl ModelsResponse {
    pub fn new(data: Vec<ModelObject>) -> Self {
        Self {
            object: default_list_object(),
            data,
        }
    }
}

fn default_model_object() -> String {
    "model".to_string()
}

fn default_owned_by() -> String {
    "local".to_string()
}

fn default_list_object() -> String {
    "list".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_completion_request_defaults() {
        let json = r#"{"messages": [{"role": "user", "content": "Hello"}]}"#;
        let req: ChatCompletionRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert!(req.model.is_none());
        assert!(req.temperature.is_none());
        assert!(req.max_tokens.is_none());
        assert!(req.stream.is_none());
    }

    #[test]
    fn test_request_skips_unset_options() {
        let req = ChatCompletionRequest {
            messages: vec![ChatMessage::user("Hi")],
            model: Some("m".to_string()),
            temperature: None,
            max_tokens: Some(10),
            stream: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["max_tokens"], 10);
        assert!(value.get("temperature").is_none());
        assert!(value.get("stream").is_none());
    }

    #[test]
    fn test_chat_completion_response_new() {
        let response = ChatCompletionResponse::new(
            "test-model".to_string(),
            ChatMessage::assistant("Hello!"),
            Some("stop".to_string()),
        );
        assert!(response.id.starts_with("chatcmpl-"));
        assert_eq!(response.object, "chat.completion");
        assert_eq!(response.model, "test-model");
        assert_eq!(response.choices.len(), 1);
        assert_eq!(response.choices[0].message.content, "Hello!");
        assert_eq!(response.choices[0].finish_reason, Some("stop".to_string()));
    }

    #[test]
    fn test_chat_completion_response_with_usage_and_id() {
        let response = ChatCompletionResponse::new(
            "test-model".to_string(),
            ChatMessage::assistant("Hello!"),
            Some("stop".to_string()),
        )
        .with_id("req-1")
        .with_usage(Usage::new(10, 5));

        assert_eq!(response.id, "req-1");
        let usage = response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_chunk_parses_openai_delta() {
        let json = r#"{
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": "m",
            "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}]
        }"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.content(), Some("Hel".to_string()));
        assert_eq!(chunk.finish_reason(), None);
    }

    #[test]
    fn test_chunk_parses_minimal_final_chunk() {
        let json = r#"{"choices": [{"delta": {}, "finish_reason": "stop"}]}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.content(), None);
        assert_eq!(chunk.finish_reason(), Some("stop"));
        assert_eq!(chunk.object, "chat.completion.chunk");
    }

    #[test]
    fn test_finish_chunk_carries_usage() {
        let chunk = ChatCompletionChunk::finish("req-1", "m", "stop", Usage::new(3, 4));
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["usage"]["total_tokens"], 7);
        assert!(value["choices"][0]["delta"].get("content").is_none());
    }

    #[test]
    fn test_models_response_parses_backend_listing() {
        let json = r#"{"data": [{"id": "llama3"}, {"id": "qwen2.5", "owned_by": "library"}]}"#;
        let models: ModelsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(models.object, "list");
        assert_eq!(models.data.len(), 2);
        assert_eq!(models.data[0].owned_by, "local");
        assert_eq!(models.data[1].owned_by, "library");
    }
}
