//! OpenAI Chat Completions client.

use std::fmt;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use crate::retry::{RetryConfig, send_with_retry};
use crate::sse_types::{ChatCompletion, ChatCompletionChunk};
use crate::{
    GenerationError, GenerationRequest, Generator, ResponseMode, SseParseAction, SseParser,
    StreamEvent, http_client, into_success, process_sse_stream,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const COMPLETIONS_PATH: &str = "/v1/chat/completions";
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Permit a plain `http://` base URL. Only meant for local test servers.
    pub allow_http: bool,
    /// Longest silence tolerated between stream chunks.
    pub idle_timeout: Duration,
    pub retry: RetryConfig,
}

impl OpenAiConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            allow_http: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("allow_http", &self.allow_http)
            .field("idle_timeout", &self.idle_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

#[derive(Default)]
struct ChatCompletionsParser;

impl SseParser for ChatCompletionsParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let chunk: ChatCompletionChunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Failed to parse chat completion chunk: {e}");
                return SseParseAction::Continue;
            }
        };

        if let Some(error) = chunk.error {
            let message = if error.message.is_empty() {
                error
                    .error_type
                    .unwrap_or_else(|| "unknown stream error".to_string())
            } else {
                error.message
            };
            return SseParseAction::Error(message);
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return SseParseAction::Continue;
        };

        if let Some(refusal) = choice.delta.refusal.filter(|r| !r.is_empty()) {
            return SseParseAction::Error(format!("Model refused: {refusal}"));
        }

        let text = choice.delta.content.filter(|c| !c.is_empty());
        match (text, choice.finish_reason) {
            (Some(text), Some(_)) => SseParseAction::Emit(vec![StreamEvent::TextDelta(text)]),
            (None, Some(reason)) if reason == "length" => {
                tracing::warn!("Completion truncated at max_tokens");
                SseParseAction::Done
            }
            (None, Some(_)) => SseParseAction::Done,
            (Some(text), None) => SseParseAction::Emit(vec![StreamEvent::TextDelta(text)]),
            (None, None) => SseParseAction::Continue,
        }
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

/// [`Generator`] backed by the Chat Completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    config: OpenAiConfig,
    client: reqwest::Client,
    endpoint: String,
}

impl OpenAiGenerator {
    pub fn new(config: OpenAiConfig) -> Result<Self, GenerationError> {
        if config.api_key.trim().is_empty() {
            return Err(GenerationError::Config("missing API key".to_string()));
        }
        if config.model.trim().is_empty() {
            return Err(GenerationError::Config("missing model name".to_string()));
        }
        let client = http_client(config.allow_http)?;
        let endpoint = format!("{}{COMPLETIONS_PATH}", config.base_url.trim_end_matches('/'));
        Ok(Self {
            config,
            client,
            endpoint,
        })
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_request_body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(self.config.model));
        body.insert("messages".to_string(), json!(request.messages));
        body.insert("max_tokens".to_string(), json!(request.max_tokens));
        body.insert("stream".to_string(), json!(stream));
        if request.mode == ResponseMode::JsonObject {
            body.insert(
                "response_format".to_string(),
                json!({ "type": "json_object" }),
            );
        }
        Value::Object(body)
    }

    async fn post(
        &self,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, GenerationError> {
        let auth_header = format!("Bearer {}", self.config.api_key);
        let outcome = send_with_retry(
            || {
                self.client
                    .post(&self.endpoint)
                    .header("Authorization", &auth_header)
                    .header("content-type", "application/json")
                    .json(body)
            },
            timeout,
            &self.config.retry,
        )
        .await;
        into_success(outcome).await
    }
}

impl Generator for OpenAiGenerator {
    async fn complete(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let body = self.build_request_body(&request, false);
        let response = self.post(&body, Some(COMPLETE_TIMEOUT)).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| GenerationError::Decode(e.to_string()))?;
        completion.into_text().ok_or(GenerationError::EmptyCompletion)
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), GenerationError> {
        let body = self.build_request_body(&request, true);
        // Streaming requests carry no total timeout; the idle timeout bounds them.
        let response = self.post(&body, None).await?;
        let mut parser = ChatCompletionsParser;
        process_sse_stream(response, &mut parser, &tx, self.config.idle_timeout).await
    }
}
