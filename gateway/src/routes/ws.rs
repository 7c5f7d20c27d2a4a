//! WebSocket frontend for persistent client connections.
//!
//! A connection carries at most one active generation. Starting a new one
//! cancels the previous, and errors never close the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use streamgate_common::{ChatCompletionRequest, ClientMessage, ErrorCode, ServerMessage};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::gateway::{GenerationHandle, GenerationRequest, StreamEvent};
use crate::identity::ClientIdentity;
use crate::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let client = state
        .identities
        .resolve(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    tracing::info!(client = %client.id, "WebSocket connection");
    ws.on_upgrade(move |socket| handle_socket(socket, state, client))
}

/// Per-connection state.
struct Session {
    state: Arc<AppState>,
    client: ClientIdentity,
    active: Option<GenerationHandle>,
}

impl Session {
    /// Cancel the active generation, returning its request id.
    fn cancel_active(&mut self) -> Option<String> {
        let handle = self.active.take()?;
        handle.cancel();
        Some(handle.request_id().to_string())
    }

    async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                return vec![ServerMessage::error(
                    None,
                    ErrorCode::InvalidRequest,
                    format!("invalid message: {}", e),
                )]
            }
        };

        match msg {
            ClientMessage::Authenticate { token } => match self.state.identities.from_api_key(&token) {
                Some(identity) => {
                    let tier = identity.tier.clone();
                    self.client = identity;
                    vec![ServerMessage::Authenticated { tier }]
                }
                None => vec![ServerMessage::error(
                    None,
                    ErrorCode::InvalidRequest,
                    "unknown API key",
                )],
            },
            ClientMessage::Interrupt => match self.cancel_active() {
                Some(request_id) => vec![ServerMessage::error(
                    Some(request_id),
                    ErrorCode::Cancelled,
                    "generation interrupted",
                )],
                None => vec![ServerMessage::error(
                    None,
                    ErrorCode::NotFound,
                    "no active generation",
                )],
            },
            ClientMessage::Generate {
                request_id,
                model,
                messages,
                temperature,
                max_tokens,
            } => {
                let mut replies = Vec::new();
                if let Some(previous) = self.cancel_active() {
                    replies.push(ServerMessage::error(
                        Some(previous),
                        ErrorCode::Cancelled,
                        "superseded by a new generation",
                    ));
                }

                let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let body = ChatCompletionRequest {
                    messages,
                    model: Some(model),
                    temperature,
                    max_tokens,
                    stream: Some(true),
                };
                let started = match GenerationRequest::from_chat(
                    request_id.clone(),
                    body,
                    self.client.clone(),
                ) {
                    Ok(request) => self.state.service.stream(request).await,
                    Err(e) => Err(e),
                };
                match started {
                    Ok(handle) => self.active = Some(handle),
                    Err(e) => replies.push(ServerMessage::error(
                        Some(request_id),
                        e.code(),
                        e.to_string(),
                    )),
                }
                replies
            }
        }
    }
}

/// Next event of the active generation; pending forever when idle.
async fn next_event(active: &mut Option<GenerationHandle>) -> Option<StreamEvent> {
    match active {
        Some(handle) => handle.next_event().await,
        None => std::future::pending().await,
    }
}

/// Translate a generation event. The flag is true when the event ends the generation.
fn event_message(request_id: &str, event: Option<StreamEvent>) -> (ServerMessage, bool) {
    let request_id = request_id.to_string();
    match event {
        Some(StreamEvent::Token(content)) => (ServerMessage::Token { request_id, content }, false),
        Some(StreamEvent::Completed(completion)) => (
            ServerMessage::GenerationComplete {
                request_id,
                content: completion.content,
                usage: completion.usage,
            },
            true,
        ),
        Some(StreamEvent::Failed(e)) => (
            ServerMessage::error(Some(request_id), e.code(), e.to_string()),
            true,
        ),
        Some(StreamEvent::Cancelled) | None => (
            ServerMessage::error(Some(request_id), ErrorCode::Cancelled, "generation cancelled"),
            true,
        ),
    }
}

/// Handle an individual client connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, client: ClientIdentity) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let client_id = client.id.clone();
    let mut session = Session {
        state,
        client,
        active: None,
    };

    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    'conn: loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        for reply in session.handle_text(&text).await {
                            if let Err(e) = send_message(&mut ws_tx, &reply).await {
                                tracing::warn!("Failed to send to {}: {}", client_id, e);
                                break 'conn;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::warn!("Failed to send pong to {}: {}", client_id, e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ignore binary, pong
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error from {}: {}", client_id, e);
                        break;
                    }
                }
            }

            event = next_event(&mut session.active) => {
                let request_id = session
                    .active
                    .as_ref()
                    .map(|h| h.request_id().to_string())
                    .unwrap_or_default();
                let (msg, terminal) = event_message(&request_id, event);
                if terminal {
                    session.active = None;
                }
                if let Err(e) = send_message(&mut ws_tx, &msg).await {
                    tracing::warn!("Failed to send to {}: {}", client_id, e);
                    break;
                }
            }

            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(request_id) = session.cancel_active() {
        tracing::info!(request_id = %request_id, "Client disconnected mid-generation");
    }
    tracing::info!("WebSocket client {} disconnected", client_id);
}

/// Send a ServerMessage over WebSocket.
async fn send_message<S>(
    sink: &mut S,
    msg: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::{Completion, CompletionSource};
    use crate::test_util::{create_test_state, test_config, MockStep, TEST_API_KEY};
    use streamgate_common::Usage;

    async fn session() -> (Session, Arc<crate::test_util::MockBackend>) {
        let (state, mock) = create_test_state(test_config(&[("a", "http://a")])).await;
        let client = state.identities.anonymous(None);
        (
            Session {
                state,
                client,
                active: None,
            },
            mock,
        )
    }

    fn generate(request_id: &str) -> String {
        serde_json::json!({
            "type": "generate",
            "request_id": request_id,
            "model": "m",
            "messages": [{"role": "user", "content": "Hi"}]
        })
        .to_string()
    }

    #[test]
    fn test_event_message_terminal_flags() {
        let (msg, terminal) = event_message("r", Some(StreamEvent::Token("a".into())));
        assert!(!terminal);
        assert!(matches!(msg, ServerMessage::Token { ref content, .. } if content == "a"));

        let completion = Completion {
            content: "ab".into(),
            finish_reason: "stop".into(),
            usage: Usage::new(1, 2),
            source: CompletionSource::Cache,
        };
        let (msg, terminal) = event_message("r", Some(StreamEvent::Completed(completion)));
        assert!(terminal);
        assert!(matches!(msg, ServerMessage::GenerationComplete { ref content, .. } if content == "ab"));

        let (msg, terminal) =
            event_message("r", Some(StreamEvent::Failed(GatewayError::Backend("x".into()))));
        assert!(terminal);
        assert!(matches!(msg, ServerMessage::Error { code: ErrorCode::BackendError, .. }));

        let (msg, _) = event_message("r", None);
        assert!(matches!(msg, ServerMessage::Error { code: ErrorCode::Cancelled, .. }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_invalid_request() {
        let (mut session, _) = session().await;
        let replies = session.handle_text("{not json").await;
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            replies[0],
            ServerMessage::Error { code: ErrorCode::InvalidRequest, request_id: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_authenticate_switches_tier() {
        let (mut session, _) = session().await;
        let msg = serde_json::json!({"type": "authenticate", "token": TEST_API_KEY}).to_string();
        let replies = session.handle_text(&msg).await;
        assert_eq!(
            replies,
            vec![ServerMessage::Authenticated {
                tier: "authenticated".to_string()
            }]
        );
        assert!(session.client.id.starts_with("key:"));

        let bad = serde_json::json!({"type": "authenticate", "token": "nope"}).to_string();
        let replies = session.handle_text(&bad).await;
        assert!(matches!(replies[0], ServerMessage::Error { code: ErrorCode::InvalidRequest, .. }));
        assert_eq!(session.client.tier, "authenticated");
    }

    #[tokio::test]
    async fn test_generate_streams_tokens_then_completes() {
        let (mut session, _) = session().await;
        assert!(session.handle_text(&generate("g1")).await.is_empty());

        let mut messages = Vec::new();
        loop {
            let event = next_event(&mut session.active).await;
            let (msg, terminal) = event_message("g1", event);
            messages.push(msg);
            if terminal {
                break;
            }
        }
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            messages.last(),
            Some(ServerMessage::GenerationComplete { content, .. }) if content == "Hello world"
        ));
    }

    #[tokio::test]
    async fn test_new_generate_cancels_previous() {
        let (mut session, mock) = session().await;
        mock.set_default_script(vec![MockStep::token("a"), MockStep::Stall]);
        session.handle_text(&generate("first")).await;

        let replies = session.handle_text(&generate("second")).await;
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            &replies[0],
            ServerMessage::Error { code: ErrorCode::Cancelled, request_id: Some(id), .. } if id == "first"
        ));
        assert_eq!(session.active.as_ref().map(|h| h.request_id()), Some("second"));
    }

    #[tokio::test]
    async fn test_interrupt() {
        let (mut session, mock) = session().await;
        let interrupt = r#"{"type": "interrupt"}"#;

        let replies = session.handle_text(interrupt).await;
        assert!(matches!(replies[0], ServerMessage::Error { code: ErrorCode::NotFound, .. }));

        mock.set_default_script(vec![MockStep::Stall]);
        session.handle_text(&generate("g")).await;
        let replies = session.handle_text(interrupt).await;
        assert!(matches!(
            &replies[0],
            ServerMessage::Error { code: ErrorCode::Cancelled, request_id: Some(id), .. } if id == "g"
        ));
        assert!(session.active.is_none());
    }

    #[tokio::test]
    async fn test_generate_without_backend_reports_error() {
        let (mut session, _) = session().await;
        let msg = serde_json::json!({
            "type": "generate",
            "request_id": "x",
            "model": "missing",
            "messages": [{"role": "user", "content": "Hi"}]
        })
        .to_string();
        let replies = session.handle_text(&msg).await;
        assert!(matches!(
            &replies[0],
            ServerMessage::Error { code: ErrorCode::NotAvailable, request_id: Some(id), .. } if id == "x"
        ));
        assert!(session.active.is_none());
    }
}
