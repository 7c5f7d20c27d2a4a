//! Backend client abstraction.
//!
//! This module defines the `BackendClient` trait that hides how the gateway
//! talks to inference backends. The production implementation speaks the
//! OpenAI-compatible HTTP API; tests substitute a scripted client.

mod openai;
mod sse;

pub use openai::HttpBackendClient;
pub use sse::SseDecoder;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use streamgate_common::{ChatCompletionRequest, Usage};

/// One decoded unit of a backend's streamed response.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendChunk {
    /// A piece of generated text, in emission order.
    Token(String),
    /// The final-chunk marker. Nothing follows it.
    Done {
        finish_reason: Option<String>,
        usage: Option<Usage>,
    },
}

/// Streamed chunks of one generation.
///
/// Dropping the stream closes the underlying connection; that is the only
/// cancellation signal a backend receives.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<BackendChunk, BackendError>> + Send>>;

/// Failures talking to a backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// HTTP 429/503: the backend is out of capacity.
    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("backend reported error mid-stream: {0}")]
    Stream(String),

    #[error("stream ended before completion")]
    Truncated,
}

/// Client for OpenAI-compatible inference backends.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Start a streamed chat completion against the backend at `endpoint`.
    ///
    /// Resolves once response headers arrive; chunks follow on the stream.
    async fn chat_stream(
        &self,
        endpoint: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, BackendError>;

    /// List model ids served by the backend (`GET /v1/models`).
    async fn list_models(&self, endpoint: &str) -> Result<Vec<String>, BackendError>;
}
