//! Generation tasks: one per request, relaying backend tokens to one client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use streamgate_common::Usage;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::registry::{BackendInstance, LoadGuard};
use super::selector::Selector;
use super::task::{
    Completion, CompletionSource, GenerationHandle, GenerationRequest, StreamEvent, TaskState,
};
use crate::cache::{request_key, CacheEntry, ResponseCache};
use crate::config::StreamingConfig;
use crate::error::GatewayError;
use crate::llm::{BackendChunk, BackendClient, BackendError};

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Events buffered per task before the backend read waits.
    pub channel_capacity: usize,
    /// Longest silence tolerated from a backend, and longest wait for a
    /// client to accept an event.
    pub token_timeout: Duration,
    /// Retry stalled/overloaded generations once on another backend.
    pub retry_transient: bool,
}

impl From<&StreamingConfig> for MultiplexerConfig {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            channel_capacity: config.channel_capacity.max(1),
            token_timeout: config.token_timeout(),
            retry_transient: config.retry_transient,
        }
    }
}

#[derive(Debug)]
struct TaskEntry {
    cancel: CancellationToken,
    state: watch::Receiver<TaskState>,
}

type TaskMap = Arc<Mutex<HashMap<String, TaskEntry>>>;

fn lock(tasks: &TaskMap) -> std::sync::MutexGuard<'_, HashMap<String, TaskEntry>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A request id's claim on the task map. Removed exactly once, explicitly
/// or on drop, so an aborted task never leaves its id blocked.
struct TaskSlot {
    tasks: TaskMap,
    request_id: String,
    held: bool,
}

impl TaskSlot {
    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            lock(&self.tasks).remove(&self.request_id);
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owns all in-flight generation tasks.
pub struct StreamMultiplexer {
    selector: Selector,
    client: Arc<dyn BackendClient>,
    cache: Arc<ResponseCache>,
    config: MultiplexerConfig,
    tasks: TaskMap,
}

impl StreamMultiplexer {
    pub fn new(
        selector: Selector,
        client: Arc<dyn BackendClient>,
        cache: Arc<ResponseCache>,
        config: MultiplexerConfig,
    ) -> Self {
        Self {
            selector,
            client,
            cache,
            config,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a generation task for `request`.
    ///
    /// Fails with `Conflict` when a task with the same request id is still
    /// active, and with `NotAvailable` when no backend can take it.
    pub async fn start(&self, request: GenerationRequest) -> Result<GenerationHandle, GatewayError> {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(TaskState::Queued);
        let slot = self.claim(&request.request_id, cancel.clone(), state_rx.clone())?;

        let (backend, lease) = self.selector.acquire(&request.model, &[]).await?;
        let (events_tx, events_rx) = mpsc::channel(self.config.channel_capacity.max(1));

        tracing::info!(
            request_id = %request.request_id,
            backend = %backend.id,
            model = %request.model,
            "Starting generation"
        );

        let handle = GenerationHandle::new(
            request.request_id.clone(),
            request.model.clone(),
            events_rx,
            cancel.clone(),
            state_rx,
        );

        let task = GenerationTask {
            request,
            backend,
            lease: Some(lease),
            slot,
            client: self.client.clone(),
            selector: self.selector.clone(),
            cache: self.cache.clone(),
            config: self.config.clone(),
            cancel,
            events: events_tx,
            state: state_tx,
            output: String::new(),
            tokens: 0,
        };
        tokio::spawn(task.run());

        Ok(handle)
    }

    fn claim(
        &self,
        request_id: &str,
        cancel: CancellationToken,
        state: watch::Receiver<TaskState>,
    ) -> Result<TaskSlot, GatewayError> {
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(request_id) {
            return Err(GatewayError::Conflict(request_id.to_string()));
        }
        tasks.insert(request_id.to_string(), TaskEntry { cancel, state });
        Ok(TaskSlot {
            tasks: self.tasks.clone(),
            request_id: request_id.to_string(),
            held: true,
        })
    }

    /// Cancel the active task for `request_id`. Returns whether one existed.
    pub fn cancel(&self, request_id: &str) -> bool {
        match lock(&self.tasks).get(request_id) {
            Some(entry) => {
                tracing::info!(request_id = %request_id, "Cancelling generation");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// State of the active task for `request_id`.
    pub fn state_of(&self, request_id: &str) -> Option<TaskState> {
        lock(&self.tasks).get(request_id).map(|e| *e.state.borrow())
    }

    /// Number of active tasks.
    pub fn active_count(&self) -> usize {
        lock(&self.tasks).len()
    }
}

enum Outcome {
    Completed {
        finish_reason: Option<String>,
        usage: Option<Usage>,
    },
    Failed(GatewayError),
    Cancelled,
}

struct GenerationTask {
    request: GenerationRequest,
    backend: BackendInstance,
    lease: Option<LoadGuard>,
    slot: TaskSlot,
    client: Arc<dyn BackendClient>,
    selector: Selector,
    cache: Arc<ResponseCache>,
    config: MultiplexerConfig,
    cancel: CancellationToken,
    events: mpsc::Sender<StreamEvent>,
    state: watch::Sender<TaskState>,
    output: String,
    tokens: u32,
}

impl GenerationTask {
    async fn run(mut self) {
        let mut tried: Vec<String> = Vec::new();

        let outcome = loop {
            match self.stream_from_backend().await {
                Outcome::Failed(err) if self.may_retry(&err, &tried) => {
                    tried.push(self.backend.id.clone());
                    self.release_lease();
                    match self.selector.acquire(&self.request.model, &tried).await {
                        Ok((backend, lease)) => {
                            tracing::warn!(
                                request_id = %self.request.request_id,
                                "{}; retrying on backend {}",
                                err,
                                backend.id
                            );
                            self.backend = backend;
                            self.lease = Some(lease);
                        }
                        Err(_) => break Outcome::Failed(err),
                    }
                }
                outcome => break outcome,
            }
        };

        self.finish(outcome).await;
    }

    /// A transient failure is retried once, only while nothing has been
    /// relayed and the client is still listening.
    fn may_retry(&self, err: &GatewayError, tried: &[String]) -> bool {
        self.config.retry_transient
            && err.is_transient()
            && tried.is_empty()
            && self.tokens == 0
            && !self.cancel.is_cancelled()
            && !self.events.is_closed()
    }

    async fn stream_from_backend(&mut self) -> Outcome {
        self.set_state(TaskState::Dispatched);
        let timeout = self.config.token_timeout;
        let body = self.request.to_backend_request();

        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            result = tokio::time::timeout(timeout, self.client.chat_stream(&self.backend.endpoint, &body)) => result,
        };
        let mut stream = match connected {
            Err(_) => return Outcome::Failed(self.stalled()),
            Ok(Err(e)) => return Outcome::Failed(GatewayError::from_backend(e, &self.backend.id)),
            Ok(Ok(stream)) => stream,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                next = tokio::time::timeout(timeout, stream.next()) => next,
            };

            match next {
                Err(_) => return Outcome::Failed(self.stalled()),
                Ok(None) => {
                    return Outcome::Failed(GatewayError::from_backend(
                        BackendError::Truncated,
                        &self.backend.id,
                    ))
                }
                Ok(Some(Err(e))) => {
                    return Outcome::Failed(GatewayError::from_backend(e, &self.backend.id))
                }
                Ok(Some(Ok(BackendChunk::Token(token)))) => {
                    self.set_state(TaskState::Streaming);
                    self.output.push_str(&token);
                    self.tokens += 1;
                    if !self.relay(StreamEvent::Token(token)).await {
                        return Outcome::Cancelled;
                    }
                }
                Ok(Some(Ok(BackendChunk::Done {
                    finish_reason,
                    usage,
                }))) => {
                    self.set_state(TaskState::Streaming);
                    return Outcome::Completed {
                        finish_reason,
                        usage,
                    };
                }
            }
        }
    }

    /// Hand one event to the client, waiting while its buffer is full.
    /// Returns `false` when the client is gone or stopped reading.
    async fn relay(&self, event: StreamEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = tokio::time::timeout(self.config.token_timeout, self.events.send(event)) => match sent {
                Ok(Ok(())) => true,
                Ok(Err(_)) => {
                    tracing::debug!(request_id = %self.request.request_id, "Client went away");
                    false
                }
                // A client that stops reading for a whole token timeout counts as
                // disconnected, so the task ends Cancelled rather than Failed.
                Err(_) => {
                    tracing::warn!(request_id = %self.request.request_id, "Client stopped reading");
                    false
                }
            },
        }
    }

    fn stalled(&self) -> GatewayError {
        GatewayError::BackendStalled {
            backend_id: self.backend.id.clone(),
            timeout_secs: self.config.token_timeout.as_secs(),
        }
    }

    fn set_state(&self, next: TaskState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn release_lease(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
    }

    async fn finish(mut self, outcome: Outcome) {
        let (state, event) = match outcome {
            Outcome::Completed {
                finish_reason,
                usage,
            } => {
                let usage = usage
                    .unwrap_or_else(|| Usage::new(self.request.estimated_prompt_tokens(), self.tokens));
                let completion = Completion {
                    content: std::mem::take(&mut self.output),
                    finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
                    usage,
                    source: CompletionSource::Backend(self.backend.id.clone()),
                };
                if self.cache.is_cacheable(self.request.temperature) {
                    let entry = CacheEntry::new(
                        completion.content.clone(),
                        completion.finish_reason.clone(),
                        usage,
                    );
                    self.cache.put(request_key(&self.request), entry).await;
                }
                (TaskState::Completed, StreamEvent::Completed(completion))
            }
            Outcome::Failed(err) => {
                tracing::warn!(request_id = %self.request.request_id, "Generation failed: {}", err);
                (TaskState::Failed, StreamEvent::Failed(err))
            }
            Outcome::Cancelled => (TaskState::Cancelled, StreamEvent::Cancelled),
        };

        self.release_lease();
        self.slot.release();
        self.set_state(state);

        tracing::info!(
            request_id = %self.request.request_id,
            backend = %self.backend.id,
            tokens = self.tokens,
            state = ?state,
            "Generation finished"
        );

        match event {
            StreamEvent::Cancelled => {
                let _ = self.events.try_send(StreamEvent::Cancelled);
            }
            event => {
                let _ = tokio::time::timeout(self.config.token_timeout, self.events.send(event)).await;
            }
        }
    }
}
