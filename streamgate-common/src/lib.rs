//! streamgate common types
//!
//! Shared types used by the gateway and by Rust clients talking to it.

pub mod chat;
pub mod error;
pub mod protocol;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChunkChoice, Delta, ModelObject, ModelsResponse, Usage,
};
pub use error::{ErrorBody, ErrorCode, ErrorResponse};
pub use protocol::{ClientMessage, ServerMessage};
