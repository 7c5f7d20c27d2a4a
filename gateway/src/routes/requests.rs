use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::delete,
    Router,
};

use crate::error::Result;
use crate::AppState;

/// DELETE /v1/requests/:request_id - Cancel an in-flight generation
async fn cancel_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<StatusCode> {
    state.service.cancel(&request_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/requests/:request_id", delete(cancel_request))
        .with_state(state)
}
