//! OpenAI-compatible chat completions, buffered or streamed over SSE.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderMap, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::post,
    Json, Router,
};
use futures_util::{stream, Stream, StreamExt};
use streamgate_common::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GatewayError;
use crate::gateway::{CompletionSource, GenerationHandle, GenerationRequest, StreamEvent};
use crate::AppState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Idempotency key from the `x-request-id` header, or a fresh UUID.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// POST /v1/chat/completions
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(body) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let client = state
        .identities
        .resolve(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    let request = GenerationRequest::from_chat(request_id(&headers), body, client)?;
    let id = request.request_id.clone();

    let mut response = if request.stream {
        let handle = state.service.stream(request).await?;
        sse_response(handle).into_response()
    } else {
        let model = request.model.clone();
        let completion = state.service.complete(request).await?;

        let mut body = ChatCompletionResponse::new(
            model,
            ChatMessage::assistant(completion.content),
            Some(completion.finish_reason),
        )
        .with_id(id.clone())
        .with_usage(completion.usage);
        if completion.source == CompletionSource::Fallback {
            body.system_fingerprint = Some("fallback".to_string());
        }
        Json(body).into_response()
    };

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}

/// Relay a generation as SSE. The stream owns a guard that cancels the
/// generation if the client disconnects.
fn sse_response(handle: GenerationHandle) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = handle.request_id().to_string();
    let model = handle.model().to_string();
    let (events, guard) = handle.into_parts();

    let stream = ReceiverStream::new(events).flat_map(move |event| {
        let _cancel_on_disconnect = &guard;
        stream::iter(sse_events(&id, &model, event))
    });

    Sse::new(stream.map(Ok)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn json_event(value: &impl serde::Serialize) -> Event {
    Event::default().data(serde_json::to_string(value).unwrap_or_default())
}

fn sse_events(id: &str, model: &str, event: StreamEvent) -> Vec<Event> {
    match event {
        StreamEvent::Token(content) => {
            vec![json_event(&ChatCompletionChunk::token(id, model, content))]
        }
        StreamEvent::Completed(completion) => {
            let last =
                ChatCompletionChunk::finish(id, model, &completion.finish_reason, completion.usage);
            vec![
                json_event(&last).event("complete"),
                Event::default().data("[DONE]"),
            ]
        }
        StreamEvent::Failed(err) => vec![json_event(&err.to_body()).event("error")],
        StreamEvent::Cancelled => {
            vec![json_event(&GatewayError::Cancelled.to_body()).event("error")]
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Completion;
    use crate::test_util::{create_test_state, test_config, MockStep};
    use streamgate_common::Usage;

    #[test]
    fn test_request_id_from_header_or_generated() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        assert_eq!(request_id(&headers), "abc-123");

        let generated = request_id(&HeaderMap::new());
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn test_completion_emits_complete_then_done() {
        let events = sse_events(
            "r",
            "m",
            StreamEvent::Completed(Completion {
                content: "hi".to_string(),
                finish_reason: "stop".to_string(),
                usage: Usage::new(1, 1),
                source: CompletionSource::Backend("a".to_string()),
            }),
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_failure_emits_single_error_event() {
        let events = sse_events("r", "m", StreamEvent::Failed(GatewayError::Backend("x".into())));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_sse_body_cancels_generation() {
        let (state, mock) = create_test_state(test_config(&[("a", "http://a")])).await;
        mock.set_default_script(vec![MockStep::token("Hel"), MockStep::Stall]);

        let body = ChatCompletionRequest {
            messages: vec![ChatMessage::user("Hi")],
            model: Some("m".to_string()),
            temperature: None,
            max_tokens: None,
            stream: Some(true),
        };
        let client = state.identities.anonymous(None);
        let request = GenerationRequest::from_chat("sse-1".to_string(), body, client).unwrap();
        let handle = state.service.stream(request).await.unwrap();

        let response = sse_response(handle).into_response();
        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("Hel"));
        assert_eq!(state.registry.get("a").await.unwrap().current_load, 1);

        drop(frames);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while state.service.multiplexer().active_count() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "generation still active");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state.registry.get("a").await.unwrap().current_load, 0);
        assert_eq!(mock.streams_abandoned(), 1);
    }
}
