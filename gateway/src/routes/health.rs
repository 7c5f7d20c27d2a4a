use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    backends: usize,
    reachable: usize,
}

/// GET /health - 200 while at least one backend is reachable, 503 otherwise
async fn health(State(state): State<Arc<AppState>>) -> Response {
    let backends = state.registry.count().await;
    let reachable = state.registry.reachable_count().await;
    let (status, label) = if reachable > 0 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };

    let body = HealthResponse {
        status: label,
        version: env!("CARGO_PKG_VERSION"),
        backends,
        reachable,
    };
    (status, Json(body)).into_response()
}

/// GET /metrics - Prometheus text exposition
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let version = env!("CARGO_PKG_VERSION");
    let body = format!(
        "# HELP streamgate_info Service information\n\
         # TYPE streamgate_info gauge\n\
         streamgate_info{{version=\"{}\"}} 1\n\
         # HELP streamgate_backends Registered backends\n\
         # TYPE streamgate_backends gauge\n\
         streamgate_backends {}\n\
         # HELP streamgate_backends_reachable Backends not marked unreachable\n\
         # TYPE streamgate_backends_reachable gauge\n\
         streamgate_backends_reachable {}\n\
         # HELP streamgate_inflight_generations Active generation tasks\n\
         # TYPE streamgate_inflight_generations gauge\n\
         streamgate_inflight_generations {}\n\
         # HELP streamgate_cache_entries Cached completions\n\
         # TYPE streamgate_cache_entries gauge\n\
         streamgate_cache_entries {}\n\
         # HELP streamgate_rate_limited_identities Identities with rate limit state\n\
         # TYPE streamgate_rate_limited_identities gauge\n\
         streamgate_rate_limited_identities {}\n",
        version,
        state.registry.count().await,
        state.registry.reachable_count().await,
        state.service.multiplexer().active_count(),
        state.cache.len().await,
        state.rate_limiter.tracked_identities(),
    );
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
