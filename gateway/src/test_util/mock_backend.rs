use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use streamgate_common::ChatCompletionRequest;

use crate::llm::{BackendChunk, BackendClient, BackendError, ChunkStream};

/// One scripted step of a mock generation.
#[derive(Debug, Clone)]
pub enum MockStep {
    Token(String),
    Delay(Duration),
    Error(BackendError),
    /// Final chunk with `finish_reason: "stop"`.
    Done,
    /// Never yield again.
    Stall,
}

impl MockStep {
    pub fn token(content: impl Into<String>) -> Self {
        MockStep::Token(content.into())
    }
}

#[derive(Debug, Default)]
struct Counters {
    chat_calls: AtomicUsize,
    models_calls: AtomicUsize,
    tokens_yielded: AtomicUsize,
    streams_abandoned: AtomicUsize,
}

#[derive(Debug)]
struct Script {
    default_steps: Vec<MockStep>,
    endpoint_steps: HashMap<String, Vec<MockStep>>,
    connect_failures: HashMap<String, BackendError>,
    models: Vec<String>,
    models_failing: bool,
    models_delay: Option<Duration>,
    calls_by_endpoint: HashMap<String, usize>,
    last_request: Option<ChatCompletionRequest>,
}

/// Scripted in-process backend.
///
/// Streams follow a per-endpoint script (or the default script), and the
/// mock records calls and streams dropped before they finished.
#[derive(Debug)]
pub struct MockBackend {
    script: Mutex<Script>,
    counters: Arc<Counters>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Answers "Hello world" in two tokens and serves model "m".
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script {
                default_steps: vec![
                    MockStep::token("Hello"),
                    MockStep::token(" world"),
                    MockStep::Done,
                ],
                endpoint_steps: HashMap::new(),
                connect_failures: HashMap::new(),
                models: vec!["m".to_string()],
                models_failing: false,
                models_delay: None,
                calls_by_endpoint: HashMap::new(),
                last_request: None,
            }),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_models(self, models: Vec<String>) -> Self {
        self.lock().models = models;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn set_default_script(&self, steps: Vec<MockStep>) {
        self.lock().default_steps = steps;
    }

    pub fn set_script(&self, endpoint: &str, steps: Vec<MockStep>) {
        self.lock().endpoint_steps.insert(endpoint.to_string(), steps);
    }

    /// Make `chat_stream` against `endpoint` fail before streaming.
    pub fn fail_connect(&self, endpoint: &str, error: BackendError) {
        self.lock().connect_failures.insert(endpoint.to_string(), error);
    }

    pub fn set_models_failing(&self, failing: bool) {
        self.lock().models_failing = failing;
    }

    pub fn set_models_delay(&self, delay: Duration) {
        self.lock().models_delay = Some(delay);
    }

    pub fn chat_calls(&self) -> usize {
        self.counters.chat_calls.load(Ordering::SeqCst)
    }

    pub fn chat_calls_to(&self, endpoint: &str) -> usize {
        self.lock().calls_by_endpoint.get(endpoint).copied().unwrap_or(0)
    }

    pub fn models_calls(&self) -> usize {
        self.counters.models_calls.load(Ordering::SeqCst)
    }

    pub fn tokens_yielded(&self) -> usize {
        self.counters.tokens_yielded.load(Ordering::SeqCst)
    }

    /// Streams dropped before their final chunk, i.e. cancelled connections.
    pub fn streams_abandoned(&self) -> usize {
        self.counters.streams_abandoned.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatCompletionRequest> {
        self.lock().last_request.clone()
    }
}

/// Counts the stream as abandoned if dropped before it finished.
struct StreamProbe {
    finished: bool,
    counters: Arc<Counters>,
}

impl StreamProbe {
    fn mark_finished(&mut self) {
        self.finished = true;
    }
}

impl Drop for StreamProbe {
    fn drop(&mut self) {
        if !self.finished {
            self.counters.streams_abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn scripted_stream(steps: Vec<MockStep>, counters: Arc<Counters>) -> ChunkStream {
    let probe = StreamProbe {
        finished: false,
        counters,
    };
    let steps: VecDeque<MockStep> = steps.into();

    Box::pin(stream::unfold((steps, probe), |(mut steps, mut probe)| async move {
        loop {
            match steps.pop_front() {
                None => {
                    probe.mark_finished();
                    return None;
                }
                Some(MockStep::Delay(delay)) => tokio::time::sleep(delay).await,
                Some(MockStep::Stall) => std::future::pending::<()>().await,
                Some(MockStep::Token(token)) => {
                    probe.counters.tokens_yielded.fetch_add(1, Ordering::SeqCst);
                    return Some((Ok(BackendChunk::Token(token)), (steps, probe)));
                }
                Some(MockStep::Done) => {
                    probe.mark_finished();
                    let done = BackendChunk::Done {
                        finish_reason: Some("stop".to_string()),
                        usage: None,
                    };
                    return Some((Ok(done), (steps, probe)));
                }
                Some(MockStep::Error(e)) => {
                    probe.mark_finished();
                    return Some((Err(e), (steps, probe)));
                }
            }
        }
    }))
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn chat_stream(
        &self,
        endpoint: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, BackendError> {
        self.counters.chat_calls.fetch_add(1, Ordering::SeqCst);
        let steps = {
            let mut script = self.lock();
            *script.calls_by_endpoint.entry(endpoint.to_string()).or_default() += 1;
            script.last_request = Some(request.clone());
            if let Some(error) = script.connect_failures.get(endpoint) {
                return Err(error.clone());
            }
            script
                .endpoint_steps
                .get(endpoint)
                .unwrap_or(&script.default_steps)
                .clone()
        };
        Ok(scripted_stream(steps, self.counters.clone()))
    }

    async fn list_models(&self, _endpoint: &str) -> Result<Vec<String>, BackendError> {
        self.counters.models_calls.fetch_add(1, Ordering::SeqCst);
        let (delay, failing, models) = {
            let script = self.lock();
            (script.models_delay, script.models_failing, script.models.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(BackendError::Connection("connection refused".to_string()));
        }
        Ok(models)
    }
}
