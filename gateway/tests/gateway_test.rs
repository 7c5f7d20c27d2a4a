use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use streamgate_gateway::config::{Config, TierConfig};
use streamgate_gateway::routes::build_router;
use streamgate_gateway::test_util::{sse_chat_body, test_config, TEST_API_KEY};
use streamgate_gateway::{AppState, HttpBackendClient};

/// A backend streaming `tokens` for every chat request.
async fn backend(tokens: &[&str]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_chat_body(tokens), "text/event-stream"),
        )
        .mount(&server)
        .await;
    server
}

async fn app_with(config: Config) -> axum::Router {
    let client = Arc::new(HttpBackendClient::new(Duration::from_secs(2)).unwrap());
    let state = Arc::new(AppState::new(config, client).await);
    build_router(state)
}

async fn app_for(server: &MockServer) -> axum::Router {
    app_with(test_config(&[("a", server.uri().as_str())])).await
}

async fn send(app: &axum::Router, method: Method, uri: &str, body: Option<Value>) -> axum::response::Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header("Content-Type", "application/json");
    }
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn chat(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hi"}],
        "temperature": 0.0,
        "stream": stream
    })
}

#[tokio::test]
async fn test_chat_completion_json() {
    let server = backend(&["Hello", " world"]).await;
    let app = app_for(&server).await;

    let response = send(&app, Method::POST, "/v1/chat/completions", Some(chat("m", false))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = body_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["completion_tokens"], 2);
}

#[tokio::test]
async fn test_chat_completion_streams_sse() {
    let server = backend(&["Hel", "lo"]).await;
    let app = app_for(&server).await;

    let response = send(&app, Method::POST, "/v1/chat/completions", Some(chat("m", true))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    let hel = text.find("\"Hel\"").expect("first token");
    let lo = text.find("\"lo\"").expect("second token");
    let complete = text.find("event: complete").expect("complete event");
    let done = text.find("data: [DONE]").expect("done marker");
    assert!(hel < lo && lo < complete && complete < done);
}

#[tokio::test]
async fn test_identical_requests_hit_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_chat_body(&["cached"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;
    let app = app_for(&server).await;

    let first = body_json(send(&app, Method::POST, "/v1/chat/completions", Some(chat("m", false))).await).await;
    let second = body_json(send(&app, Method::POST, "/v1/chat/completions", Some(chat("m", false))).await).await;
    assert_eq!(first["choices"], second["choices"]);
    assert_eq!(second["choices"][0]["message"]["content"], "cached");
}

#[tokio::test]
async fn test_unknown_model_is_not_available() {
    let server = backend(&["x"]).await;
    let app = app_for(&server).await;

    let response = send(&app, Method::POST, "/v1/chat/completions", Some(chat("other", false))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "not_available");
}

#[tokio::test]
async fn test_invalid_body_is_bad_request() {
    let server = backend(&["x"]).await;
    let app = app_for(&server).await;

    let response = send(&app, Method::POST, "/v1/chat/completions", Some(json!({"model": "m", "messages": []}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "invalid_request");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/v1/chat/completions")
                .header("Content-Type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rate_limited_with_retry_after() {
    let server = backend(&["x"]).await;
    let mut config = test_config(&[("a", server.uri().as_str())]);
    config.rate_limit.tiers.insert(
        "anonymous".to_string(),
        TierConfig {
            capacity: 50,
            refill_per_sec: 1.0,
        },
    );
    let app = app_with(config).await;

    let mut request = chat("m", false);
    request["max_tokens"] = json!(30);

    let first = send(&app, Method::POST, "/v1/chat/completions", Some(request.clone())).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = send(&app, Method::POST, "/v1/chat/completions", Some(request)).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
    assert_eq!(body_json(second).await["error"]["code"], "rate_limited");
}

#[tokio::test]
async fn test_api_key_uses_authenticated_tier() {
    let server = backend(&["x"]).await;
    let mut config = test_config(&[("a", server.uri().as_str())]);
    config.rate_limit.tiers.insert(
        "anonymous".to_string(),
        TierConfig {
            capacity: 10,
            refill_per_sec: 0.1,
        },
    );
    let app = app_with(config).await;

    let mut request = chat("m", false);
    request["max_tokens"] = json!(100);
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/chat/completions")
                    .header("Content-Type", "application/json")
                    .header("Authorization", format!("Bearer {}", TEST_API_KEY))
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_models_lists_backend_models() {
    let server = backend(&["x"]).await;
    let app = app_for(&server).await;

    let response = send(&app, Method::GET, "/v1/models", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["object"], "list");
    assert_eq!(body["data"][0]["id"], "m");
}

#[tokio::test]
async fn test_backends_endpoint() {
    let server = backend(&["x"]).await;
    let app = app_for(&server).await;

    let body = body_json(send(&app, Method::GET, "/v1/backends", None).await).await;
    let backends = body["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0]["id"], "a");
    assert_eq!(backends[0]["health"], "healthy");
    assert_eq!(backends[0]["current_load"], 0);
}

#[tokio::test]
async fn test_health_reflects_reachable_backends() {
    let server = backend(&["x"]).await;
    let app = app_for(&server).await;
    let response = send(&app, Method::GET, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["reachable"], 1);

    let empty = app_with(test_config(&[])).await;
    let response = send(&empty, Method::GET, "/health", None).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let server = backend(&["x"]).await;
    let app = app_for(&server).await;

    let response = send(&app, Method::GET, "/metrics", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(text.contains("streamgate_backends 1"));
    assert!(text.contains("streamgate_inflight_generations 0"));
}

#[tokio::test]
async fn test_cancel_unknown_request_is_not_found() {
    let server = backend(&["x"]).await;
    let app = app_for(&server).await;

    let response = send(&app, Method::DELETE, "/v1/requests/nope", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_cancel_in_flight_stream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_chat_body(&["late"]), "text/event-stream")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    let app = app_for(&server).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/v1/chat/completions")
                .header("Content-Type", "application/json")
                .header("x-request-id", "in-flight")
                .body(Body::from(chat("m", true).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cancelled = send(&app, Method::DELETE, "/v1/requests/in-flight", None).await;
    assert_eq!(cancelled.status(), StatusCode::NO_CONTENT);

    let body = tokio::time::timeout(Duration::from_secs(5), body_bytes(response))
        .await
        .expect("stream did not end after cancel");
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("event: error"));
    assert!(text.contains("\"code\":\"cancelled\""));
    assert!(!text.contains("[DONE]"));

    let again = send(&app, Method::DELETE, "/v1/requests/in-flight", None).await;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("socket closed")
            .unwrap();
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_websocket_generation() {
    let server = backend(&["Hel", "lo"]).await;
    let addr = serve(app_for(&server).await).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/v1/ws", addr))
        .await
        .unwrap();

    ws.send(WsMessage::Text(
        json!({"type": "authenticate", "token": TEST_API_KEY}).to_string(),
    ))
    .await
    .unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "authenticated");
    assert_eq!(reply["tier"], "authenticated");

    ws.send(WsMessage::Text(
        json!({
            "type": "generate",
            "request_id": "ws-1",
            "model": "m",
            "messages": [{"role": "user", "content": "Hi"}]
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "token");
    assert_eq!(first["request_id"], "ws-1");
    assert_eq!(first["content"], "Hel");
    assert_eq!(next_json(&mut ws).await["content"], "lo");

    let complete = next_json(&mut ws).await;
    assert_eq!(complete["type"], "generation_complete");
    assert_eq!(complete["content"], "Hello");

    // The socket survives errors.
    ws.send(WsMessage::Text(json!({"type": "interrupt"}).to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut ws).await["code"], "not_found");

    ws.send(WsMessage::Text("garbage".to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["code"], "invalid_request");
}

#[tokio::test]
async fn test_websocket_interrupt_cancels_generation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_chat_body(&["slow"]), "text/event-stream")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;
    let addr = serve(app_for(&server).await).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/v1/ws", addr))
        .await
        .unwrap();
    ws.send(WsMessage::Text(
        json!({
            "type": "generate",
            "request_id": "long",
            "model": "m",
            "messages": [{"role": "user", "content": "Hi"}]
        })
        .to_string(),
    ))
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    ws.send(WsMessage::Text(json!({"type": "interrupt"}).to_string()))
        .await
        .unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "cancelled");
    assert_eq!(reply["request_id"], "long");
}
