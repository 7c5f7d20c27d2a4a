//! WebSocket protocol types for persistent client connections.
//!
//! # Protocol Overview
//!
//! Messages are JSON objects with a `type` field that determines their shape.
//!
//! ## Connection Flow
//!
//! 1. Client connects to the gateway WebSocket endpoint
//! 2. Client may send `authenticate` to switch its rate-limit identity
//! 3. Client sends `generate`; the gateway replies with a series of `token`
//!    messages followed by `generation_complete` or `error`
//! 4. `interrupt` cancels the active generation; the socket stays open
//! 5. A new `generate` while one is active cancels the previous one
//!
//! Errors never close the socket, so a connection can be reused for any
//! number of sequential generations.

use serde::{Deserialize, Serialize};

use crate::{ChatMessage, ErrorCode, Usage};

/// Messages sent from client to gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present an API key; the connection adopts the key's tier.
    Authenticate { token: String },
    /// Start a generation, cancelling any generation already active.
    Generate {
        /// Idempotency key; generated by the gateway when absent.
        #[serde(default)]
        request_id: Option<String>,
        model: String,
        messages: Vec<ChatMessage>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    /// Cancel the active generation without closing the connection.
    Interrupt,
}

/// Messages sent from gateway to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledgment of a successful `authenticate`.
    Authenticated { tier: String },
    /// One incremental piece of generated text.
    Token { request_id: String, content: String },
    /// The generation finished; `content` is the full text.
    GenerationComplete {
        request_id: String,
        content: String,
        usage: Usage,
    },
    /// A request failed or was cancelled.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(request_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            request_id,
            code,
            message: message.into(),
        }
    }
}
