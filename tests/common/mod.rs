//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mnemo_engine::Pipeline;
use mnemo_engine::mnemo_context::{MemoryStore, Store, load_ledger, query_recent};
use mnemo_engine::mnemo_providers::retry::RetryConfig;
use mnemo_engine::mnemo_providers::{
    GenerationError, GenerationRequest, Generator, OpenAiConfig, OpenAiGenerator, StreamEvent,
};
use mnemo_engine::mnemo_types::{
    AnalysisBudget, AnalysisJob, ChatBudget, ContextWindowMeta, ConversationKey, TokenMetric,
    WindowBudgets,
};

/// Generator with canned replies and a request log.
///
/// `stream` emits the next chat reply word by word; `complete` pops the next
/// distillation reply. An optional gate holds streaming until opened.
#[derive(Default)]
pub struct ScriptedGenerator {
    chat: Mutex<VecDeque<Result<String, GenerationError>>>,
    completions: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<GenerationRequest>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chat(self, replies: impl IntoIterator<Item = String>) -> Self {
        self.chat.lock().unwrap().extend(replies.into_iter().map(Ok));
        self
    }

    pub fn with_chat_error(self, error: GenerationError) -> Self {
        self.chat.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn with_completions(self, replies: impl IntoIterator<Item = String>) -> Self {
        self.completions.lock().unwrap().extend(replies);
        self
    }

    /// Hold every stream until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Generator for ScriptedGenerator {
    async fn complete(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        self.requests.lock().unwrap().push(request);
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(GenerationError::EmptyCompletion)
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GenerationError> {
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let next = self.chat.lock().unwrap().pop_front();
        let reply = next.unwrap_or(Err(GenerationError::EmptyCompletion))?;
        for (i, word) in reply.split(' ').enumerate() {
            let fragment = if i == 0 {
                word.to_string()
            } else {
                format!(" {word}")
            };
            if tx.send(StreamEvent::TextDelta(fragment)).await.is_err() {
                return Ok(());
            }
        }
        let _ = tx.send(StreamEvent::Done).await;
        Ok(())
    }
}

/// `n` distinct words, so the `words` metric counts exactly `n`.
pub fn words(prefix: &str, n: usize) -> String {
    (0..n)
        .map(|i| format!("{prefix}{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Word-metric budgets with the given window maxima and a 40-word cap on
/// user messages and replies.
pub fn word_budgets(chat_max: u32, analysis_max: u32) -> WindowBudgets {
    WindowBudgets {
        chat: ChatBudget {
            metric: TokenMetric::Words,
            context_window: 8192,
            system_prompt: 0,
            response: 40,
            user_message: 40,
            wiggle_room: 0,
            max_window: chat_max,
        },
        analysis: AnalysisBudget {
            metric: TokenMetric::Words,
            context_window: 8192,
            system_prompt: 0,
            response: 500,
            user_message: 40,
            reply: 40,
            wiggle_room: 0,
            max_window: analysis_max,
        },
    }
}

pub fn conversation() -> ConversationKey {
    ConversationKey::new("acct", "ada", "mnemo").unwrap()
}

pub fn ledger(store: &dyn Store, budgets: &WindowBudgets) -> ContextWindowMeta {
    load_ledger(store, &conversation(), budgets).unwrap().meta
}

pub fn stored_message_count(store: &dyn Store) -> usize {
    query_recent(store, &conversation().messages_partition(), 1000)
        .unwrap()
        .len()
}

pub struct PipelineHarness {
    pub store: Arc<MemoryStore>,
    pub generator: Arc<ScriptedGenerator>,
    pub pipeline: Pipeline<ScriptedGenerator>,
    pub jobs: mpsc::UnboundedReceiver<AnalysisJob>,
}

pub fn pipeline_harness(generator: ScriptedGenerator, budgets: WindowBudgets) -> PipelineHarness {
    let store = Arc::new(MemoryStore::new());
    let generator = Arc::new(generator);
    let (tx, jobs) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new(store.clone(), Arc::clone(&generator), budgets, tx);
    PipelineHarness {
        store,
        generator,
        pipeline,
        jobs,
    }
}

/// OpenAI client pointed at a mock server, with near-instant retries.
pub fn openai_generator(server: &MockServer) -> OpenAiGenerator {
    let mut config = OpenAiConfig::new("sk-test", "gpt-4o-mini").with_base_url(server.uri());
    config.allow_http = true;
    config.idle_timeout = Duration::from_secs(5);
    config.retry = RetryConfig {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter_factor: 0.0,
    };
    OpenAiGenerator::new(config).unwrap()
}

/// SSE body streaming `chunks` as chat completion deltas.
pub fn sse_body(chunks: &[&str]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        let data = serde_json::json!({
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": chunk}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {data}\n\n"));
    }
    let stop = serde_json::json!({
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
    });
    body.push_str(&format!("data: {stop}\n\n"));
    body.push_str("data: [DONE]\n\n");
    body
}

/// Mount a streaming chat completion.
pub async fn mount_streaming_completion(server: &MockServer, chunks: &[&str]) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(chunks)),
        )
        .mount(server)
        .await;
}

/// Body of a non-streaming chat completion carrying `content`.
pub fn completion_body(content: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
    })
}

/// A profile that passes validation.
pub fn valid_profile_json() -> String {
    serde_json::json!({
        "basic_info": {"name": "Ada", "current_location": "London", "occupation": "engineer", "sex": ""},
        "traits": [["curious", 80, "asks probing questions"]],
        "skills": [["mathematics", 90, "discusses analytical engines"]],
        "factual_history": ["moved to London"],
        "summary": "Ada is a curious engineer living in London."
    })
    .to_string()
}
