//! Generation requests, task states and the handle clients consume.

use streamgate_common::{ChatCompletionRequest, ChatMessage, Usage};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::GatewayError;
use crate::identity::ClientIdentity;

/// A normalized, immutable generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Idempotency key. At most one active task exists per id.
    pub request_id: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub client: ClientIdentity,
}

impl GenerationRequest {
    /// Build from an OpenAI-style request body.
    pub fn from_chat(
        request_id: String,
        request: ChatCompletionRequest,
        client: ClientIdentity,
    ) -> Result<Self, GatewayError> {
        let model = request
            .model
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| GatewayError::InvalidRequest("'model' is required".to_string()))?;
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "'messages' must not be empty".to_string(),
            ));
        }
        Ok(Self {
            request_id,
            model,
            messages: request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: request.stream.unwrap_or(false),
            client,
        })
    }

    /// The body forwarded to a backend.
    pub fn to_backend_request(&self) -> ChatCompletionRequest {
        ChatCompletionRequest {
            messages: self.messages.clone(),
            model: Some(self.model.clone()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: Some(true),
        }
    }

    /// Rough prompt size: one token per four characters of content.
    pub fn estimated_prompt_tokens(&self) -> u32 {
        let chars: usize = self.messages.iter().map(|m| m.content.chars().count()).sum();
        chars.div_ceil(4).min(u32::MAX as usize) as u32
    }

    /// Prompt estimate plus the completion budget, for rate limiting.
    pub fn estimated_tokens(&self, default_max_tokens: u32) -> u32 {
        self.estimated_prompt_tokens()
            .saturating_add(self.max_tokens.unwrap_or(default_max_tokens))
    }
}

/// Lifecycle of a generation task. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Dispatched,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Where a completion came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionSource {
    Backend(String),
    Cache,
    Fallback,
}

/// A finished generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
    pub source: CompletionSource,
}

/// Events delivered to the client side of a generation, in order.
///
/// Exactly one terminal event ends the sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Completed(Completion),
    Failed(GatewayError),
    Cancelled,
}

/// The client's end of one generation task.
#[derive(Debug)]
pub struct GenerationHandle {
    request_id: String,
    model: String,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    state: watch::Receiver<TaskState>,
}

impl GenerationHandle {
    pub(crate) fn new(
        request_id: String,
        model: String,
        events: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
        state: watch::Receiver<TaskState>,
    ) -> Self {
        Self {
            request_id,
            model,
            events,
            cancel,
            state,
        }
    }

    /// A handle whose events are already complete, for answers that
    /// never reach a backend.
    pub(crate) fn ready(request_id: String, model: String, completion: Completion) -> Self {
        let (tx, rx) = mpsc::channel(2);
        let _ = tx.try_send(StreamEvent::Token(completion.content.clone()));
        let _ = tx.try_send(StreamEvent::Completed(completion));
        let (_, state) = watch::channel(TaskState::Completed);
        Self::new(request_id, model, rx, CancellationToken::new(), state)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Next event, or `None` once the task has ended and the channel drained.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Request cancellation. Takes effect at the task's next relay step.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A guard that cancels the task when dropped.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Wait until the task reaches a terminal state.
    pub async fn finished(&mut self) -> TaskState {
        let _ = self.state.wait_for(|s| s.is_terminal()).await;
        *self.state.borrow()
    }

    /// Buffer tokens until the generation ends. Dropping the returned future
    /// cancels the task.
    pub async fn collect(mut self) -> Result<Completion, GatewayError> {
        let _guard = self.cancel_on_drop();
        while let Some(event) = self.events.recv().await {
            match event {
                StreamEvent::Token(_) => {}
                StreamEvent::Completed(completion) => return Ok(completion),
                StreamEvent::Failed(err) => return Err(err),
                StreamEvent::Cancelled => return Err(GatewayError::Cancelled),
            }
        }
        Err(GatewayError::Cancelled)
    }

    /// Split into the event receiver and a guard cancelling on drop.
    pub fn into_parts(self) -> (mpsc::Receiver<StreamEvent>, DropGuard) {
        let guard = self.cancel.clone().drop_guard();
        (self.events, guard)
    }
}
