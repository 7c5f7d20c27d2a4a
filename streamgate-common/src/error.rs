//! Error codes shared by every client-facing protocol.
//!
//! HTTP bodies, terminal SSE events and WebSocket `error` messages all carry
//! one of these codes, so clients can branch on the same strings regardless
//! of transport.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a failed or interrupted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No healthy backend supports the requested model.
    NotAvailable,
    /// Admission denied by the rate limiter.
    RateLimited,
    /// The backend went silent for longer than the token timeout.
    BackendStalled,
    /// The backend returned a non-recoverable error.
    BackendError,
    /// The backend signaled capacity exhaustion.
    BackendOverloaded,
    /// The client or an operator cancelled the generation.
    Cancelled,
    /// A generation with the same request id is already in flight.
    Conflict,
    InvalidRequest,
    NotFound,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotAvailable => "not_available",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::BackendStalled => "backend_stalled",
            ErrorCode::BackendError => "backend_error",
            ErrorCode::BackendOverloaded => "backend_overloaded",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Conflict => "conflict",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::NotFound => "not_found",
        }
    }

    /// Whether a failure with this code may be retried once on another backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCode::BackendStalled | ErrorCode::BackendOverloaded)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{"code": ..., "message": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Top-level HTTP error body: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }
}
