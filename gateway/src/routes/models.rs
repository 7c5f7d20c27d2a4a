//! OpenAI-compatible /v1/models endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use streamgate_common::{ModelObject, ModelsResponse};

use crate::AppState;

/// GET /v1/models - Union of models served by reachable backends
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let data = state
        .registry
        .all_models()
        .await
        .into_iter()
        .map(ModelObject::new)
        .collect();
    Json(ModelsResponse::new(data))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .with_state(state)
}
