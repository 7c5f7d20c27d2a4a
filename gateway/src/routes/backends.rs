//! Registry introspection.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::gateway::BackendInstance;
use crate::AppState;

#[derive(Debug, Serialize)]
struct BackendsResponse {
    backends: Vec<BackendInstance>,
}

/// GET /v1/backends - Snapshot of every registered backend
async fn list_backends(State(state): State<Arc<AppState>>) -> Json<BackendsResponse> {
    Json(BackendsResponse {
        backends: state.registry.all().await,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/backends", get(list_backends))
        .with_state(state)
}
