//! Error types for the request path.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use streamgate_common::{ErrorCode, ErrorResponse};

use crate::llm::BackendError;

/// Errors surfaced to clients.
///
/// Each variant maps to one [`ErrorCode`]; HTTP, SSE and WebSocket frontends
/// all report the same code for the same failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("No available backend serves model '{0}'")]
    NotAvailable(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs:.2}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("Backend {backend_id} produced no tokens for {timeout_secs}s")]
    BackendStalled { backend_id: String, timeout_secs: u64 },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend overloaded: {0}")]
    BackendOverloaded(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Request '{0}' is already in flight")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::NotAvailable(_) => ErrorCode::NotAvailable,
            GatewayError::RateLimited { .. } => ErrorCode::RateLimited,
            GatewayError::BackendStalled { .. } => ErrorCode::BackendStalled,
            GatewayError::Backend(_) => ErrorCode::BackendError,
            GatewayError::BackendOverloaded(_) => ErrorCode::BackendOverloaded,
            GatewayError::Cancelled => ErrorCode::Cancelled,
            GatewayError::Conflict(_) => ErrorCode::Conflict,
            GatewayError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
        }
    }

    /// Eligible for a single reselect-and-retry on another backend.
    pub fn is_transient(&self) -> bool {
        self.code().is_transient()
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BackendStalled { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BackendOverloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            // nginx's "client closed request"
            GatewayError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    pub fn to_body(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }

    /// Classify a backend client failure that happened on `backend_id`.
    pub fn from_backend(err: BackendError, backend_id: &str) -> Self {
        match err {
            BackendError::Overloaded(msg) => {
                GatewayError::BackendOverloaded(format!("{}: {}", backend_id, msg))
            }
            other => GatewayError::Backend(format!("{}: {}", backend_id, other)),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            GatewayError::RateLimited { retry_after_secs } => Some(retry_after_secs.ceil() as u64),
            _ => None,
        };

        let mut response = (status, Json(self.to_body())).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
