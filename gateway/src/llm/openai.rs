//! OpenAI-compatible HTTP backend client.
//!
//! Works against any server exposing `/v1/chat/completions` and `/v1/models`
//! (Ollama, llama.cpp's llama-server, vLLM, ...).

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use streamgate_common::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelsResponse};

use super::{BackendChunk, BackendClient, BackendError, ChunkStream, SseDecoder};

/// HTTP client for OpenAI-compatible backends.
///
/// Only a connect timeout is set on the underlying client: generations are
/// long-lived, and silence between tokens is policed by the multiplexer.
pub struct HttpBackendClient {
    http_client: Client,
}

impl HttpBackendClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendError::Connection(e.to_string()))?;
        Ok(Self { http_client })
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{}", endpoint.trim_end_matches('/'), path)
    }
}

/// `{"error": ...}` as sent by most OpenAI-compatible servers.
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: serde_json::Value,
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn chat_stream(
        &self,
        endpoint: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, BackendError> {
        let url = Self::url(endpoint, "/v1/chat/completions");
        let mut request = request.clone();
        request.stream = Some(true);

        tracing::debug!("Dispatching streaming request to {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let response = check_status(response).await?;

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_event_stream {
            Ok(sse_chunk_stream(response.bytes_stream()))
        } else {
            // Backend ignored `stream: true` and answered with a single body.
            let body: ChatCompletionResponse = response
                .json()
                .await
                .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
            Ok(single_response_stream(body))
        }
    }

    async fn list_models(&self, endpoint: &str) -> Result<Vec<String>, BackendError> {
        let url = Self::url(endpoint, "/v1/models");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let response = check_status(response).await?;

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        Ok(models.data.into_iter().map(|m| m.id).collect())
    }
}

/// Map non-success statuses to `BackendError`, passing successes through.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        return Err(BackendError::Overloaded(format!("HTTP {}: {}", status.as_u16(), body)));
    }
    Err(BackendError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Decode one SSE `data:` payload into chunks.
fn parse_event(data: &str) -> Vec<Result<BackendChunk, BackendError>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(BackendChunk::Done {
            finish_reason: None,
            usage: None,
        })];
    }

    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => {
            let mut out = Vec::new();
            if let Some(content) = chunk.content() {
                if !content.is_empty() {
                    out.push(Ok(BackendChunk::Token(content)));
                }
            }
            if let Some(reason) = chunk.finish_reason() {
                out.push(Ok(BackendChunk::Done {
                    finish_reason: Some(reason.to_string()),
                    usage: chunk.usage,
                }));
            }
            out
        }
        Err(parse_err) => match serde_json::from_str::<ErrorPayload>(data) {
            Ok(payload) => vec![Err(BackendError::Stream(payload.error.to_string()))],
            Err(_) => vec![Err(BackendError::InvalidResponse(parse_err.to_string()))],
        },
    }
}

struct SseState<S> {
    body: S,
    body_done: bool,
    decoder: SseDecoder,
    pending: VecDeque<Result<BackendChunk, BackendError>>,
    finished: bool,
}

/// Turn a raw SSE byte stream into a chunk stream ending at the first
/// `Done` or error.
fn sse_chunk_stream<S, B>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
{
    let state = SseState {
        body,
        body_done: false,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            if let Some(item) = st.pending.pop_front() {
                if !matches!(item, Ok(BackendChunk::Token(_))) {
                    st.finished = true;
                    st.pending.clear();
                }
                return Some((item, st));
            }

            if st.body_done {
                st.finished = true;
                return Some((Err(BackendError::Truncated), st));
            }

            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for data in st.decoder.push(bytes.as_ref()) {
                        st.pending.extend(parse_event(&data));
                    }
                }
                Some(Err(e)) => {
                    st.pending.push_back(Err(BackendError::Connection(e.to_string())));
                }
                None => {
                    st.body_done = true;
                    for data in st.decoder.finish() {
                        st.pending.extend(parse_event(&data));
                    }
                }
            }
        }
    }))
}

/// Present a non-streamed completion as a two-chunk stream.
fn single_response_stream(body: ChatCompletionResponse) -> ChunkStream {
    let choice = body.choices.into_iter().next();
    let (content, finish_reason) = match choice {
        Some(c) => (c.message.content, c.finish_reason),
        None => (String::new(), None),
    };

    let mut chunks = Vec::with_capacity(2);
    if !content.is_empty() {
        chunks.push(Ok(BackendChunk::Token(content)));
    }
    chunks.push(Ok(BackendChunk::Done {
        finish_reason: finish_reason.or_else(|| Some("stop".to_string())),
        usage: body.usage,
    }));

    Box::pin(stream::iter(chunks))
}
