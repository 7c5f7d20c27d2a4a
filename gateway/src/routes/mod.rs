pub mod backends;
pub mod chat;
pub mod health;
pub mod models;
pub mod requests;
pub mod ws;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::logging::request_logger;
use crate::AppState;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .merge(chat::router(state.clone()))
        .merge(models::router(state.clone()))
        .merge(requests::router(state.clone()))
        .merge(backends::router(state.clone()))
        .merge(ws::router(state.clone()));

    Router::new()
        .merge(health::router(state))
        .nest("/v1", v1)
        .layer(middleware::from_fn(request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
