//! Backend management and generation dispatch.
//!
//! This module provides:
//! - Backend registry with per-instance load and health state
//! - Health monitor probing backends and opening circuits
//! - Weighted-least-load selector
//! - Stream multiplexer running one task per generation
//! - The service facade the HTTP and WebSocket frontends call into

pub mod health;
pub mod multiplexer;
mod registry;
mod selector;
mod service;
mod task;

pub use health::{HealthMonitor, HealthPolicy};
pub use multiplexer::{MultiplexerConfig, StreamMultiplexer};
pub use registry::{BackendHealth, BackendInstance, BackendRegistry, LoadGuard};
pub use selector::Selector;
pub use service::GatewayService;
pub use task::{
    Completion, CompletionSource, GenerationHandle, GenerationRequest, StreamEvent, TaskState,
};
