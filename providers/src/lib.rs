//! Generation service clients with streaming support.
//!
//! # Architecture
//!
//! - [`Generator`] - the seam the engine talks to: one blocking completion, or
//!   a stream of incremental text
//! - [`openai`] - OpenAI Chat Completions client
//! - [`retry`] - HTTP retry policy shared by clients
//!
//! Streaming clients emit events through a [`tokio::sync::mpsc::Sender<StreamEvent>`]
//! channel, allowing the caller to forward content as it arrives.
//!
//! # Error Handling
//!
//! API errors during streaming are delivered as `StreamEvent::Error` events
//! rather than `Result::Err` returns, so partial output can be captured before
//! the failure. Failures that prevent reading the HTTP response stream at all
//! return `Err`.

pub mod openai;
pub mod retry;
pub mod sse_types;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

pub use openai::{OpenAiConfig, OpenAiGenerator};

const CONNECT_TIMEOUT_SECS: u64 = 30;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Output shape requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    #[default]
    Text,
    /// Constrain the reply to a single JSON object.
    JsonObject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub mode: ResponseMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    Done,
    Error(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request failed after {attempts} attempts: {message}")]
    Connection { attempts: u32, message: String },
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("model returned no content")]
    EmptyCompletion,
    #[error("invalid client configuration: {0}")]
    Config(String),
}

/// A completion service.
///
/// Implementations must be shareable across tasks: the engine keeps one
/// generator for chat turns and hands a clone of it to the distillation worker.
pub trait Generator: Send + Sync {
    /// Return the whole completion at once.
    fn complete(
        &self,
        request: GenerationRequest,
    ) -> impl Future<Output = Result<String, GenerationError>> + Send;

    /// Send incremental text to `tx`, finishing with `Done` or `Error`.
    fn stream(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> impl Future<Output = Result<(), GenerationError>> + Send;
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
}

/// Build an HTTP client. Plain `http://` is refused unless `allow_http` is set.
pub fn http_client(allow_http: bool) -> Result<reqwest::Client, GenerationError> {
    base_client_builder()
        .https_only(!allow_http)
        .build()
        .map_err(|e| GenerationError::Config(format!("failed to build HTTP client: {e}")))
}

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

/// Join the `data:` lines of one SSE event.
fn extract_sse_data(event: &str) -> Option<String> {
    let mut lines = event
        .lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .peekable();

    lines.peek()?;
    Some(lines.collect::<Vec<_>>().join("\n"))
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    Continue,
    Emit(Vec<StreamEvent>),
    Done,
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    fn provider_name(&self) -> &'static str;
}

pub(crate) async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Drive an SSE response through `parser`, forwarding events to `tx`.
///
/// Handles idle timeouts, buffer limits, UTF-8 validation, event boundaries,
/// the `[DONE]` marker and a small tolerance for malformed payloads. Exactly
/// one terminal event (`Done` or `Error`) is sent unless the receiver is gone.
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
) -> Result<(), GenerationError> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_event(tx, StreamEvent::Error("Stream idle timeout".to_string())).await;
            return Ok(());
        };

        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| GenerationError::Stream(e.to_string()))?;
        buffer.extend_from_slice(&chunk);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                StreamEvent::Error("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return Ok(());
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                let _ = send_event(
                    tx,
                    StreamEvent::Error("Received invalid UTF-8 from SSE stream".to_string()),
                )
                .await;
                return Ok(());
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                let _ = send_event(tx, StreamEvent::Done).await;
                return Ok(());
            }

            let json = match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => json,
                Err(e) => {
                    parse_errors += 1;
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        provider = parser.provider_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            StreamEvent::Error(format!("Invalid stream payload: {e}")),
                        )
                        .await;
                        return Ok(());
                    }
                    continue;
                }
            };
            parse_errors = 0;

            match parser.parse(&json) {
                SseParseAction::Continue => {}
                SseParseAction::Emit(events) => {
                    for event in events {
                        if !send_event(tx, event).await {
                            return Ok(());
                        }
                    }
                }
                SseParseAction::Done => {
                    let _ = send_event(tx, StreamEvent::Done).await;
                    return Ok(());
                }
                SseParseAction::Error(msg) => {
                    let _ = send_event(tx, StreamEvent::Error(msg)).await;
                    return Ok(());
                }
            }
        }
    }

    let _ = send_event(
        tx,
        StreamEvent::Error("Connection closed before stream completed".to_string()),
    )
    .await;
    Ok(())
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Turn a retry outcome into a successful response or a [`GenerationError`].
pub(crate) async fn into_success(
    outcome: retry::RetryOutcome,
) -> Result<reqwest::Response, GenerationError> {
    match outcome {
        retry::RetryOutcome::Success(response) => Ok(response),
        retry::RetryOutcome::HttpError(response) => {
            let status = response.status().as_u16();
            let body = read_capped_error_body(response).await;
            Err(GenerationError::Api { status, body })
        }
        retry::RetryOutcome::ConnectionError { attempts, source } => {
            Err(GenerationError::Connection {
                attempts,
                message: source.to_string(),
            })
        }
    }
}
