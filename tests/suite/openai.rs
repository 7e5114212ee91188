//! OpenAI chat completions client against a mock server

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mnemo_engine::mnemo_providers::{
    ChatMessage, GenerationError, GenerationRequest, Generator, ResponseMode, StreamEvent,
};
use mnemo_engine::{MemoryStore, Pipeline, TurnRequest, TurnResponse};

use crate::common::{
    completion_body, conversation, mount_streaming_completion, openai_generator, sse_body,
    valid_profile_json, word_budgets,
};

fn request(mode: ResponseMode) -> GenerationRequest {
    GenerationRequest {
        messages: vec![
            ChatMessage::system("You are terse."),
            ChatMessage::user("Say hello"),
        ],
        max_tokens: 32,
        mode,
    }
}

async fn collect(generator: &impl Generator, request: GenerationRequest) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    generator.stream(request, tx).await.unwrap();
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn streams_deltas_then_done() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header_exists("idempotency-key"))
        .and(body_partial_json(serde_json::json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "max_tokens": 32,
            "messages": [
                {"role": "system", "content": "You are terse."},
                {"role": "user", "content": "Say hello"}
            ]
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&["Hel", "lo", "!"])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let events = collect(&openai_generator(&server), request(ResponseMode::Text)).await;

    assert_eq!(
        events,
        [
            StreamEvent::TextDelta("Hel".to_string()),
            StreamEvent::TextDelta("lo".to_string()),
            StreamEvent::TextDelta("!".to_string()),
            StreamEvent::Done,
        ]
    );
}

#[tokio::test]
async fn stream_error_payload_becomes_error_event() {
    let server = MockServer::start().await;
    let body = "data: {\"error\":{\"type\":\"server_error\",\"message\":\"overloaded\"}}\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let events = collect(&openai_generator(&server), request(ResponseMode::Text)).await;

    assert_eq!(events, [StreamEvent::Error("overloaded".to_string())]);
}

#[tokio::test]
async fn truncated_stream_reports_error() {
    let server = MockServer::start().await;
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let events = collect(&openai_generator(&server), request(ResponseMode::Text)).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0], StreamEvent::TextDelta("partial".to_string()));
    assert!(matches!(events[1], StreamEvent::Error(_)));
}

#[tokio::test]
async fn complete_requests_json_object_mode() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "stream": false,
            "response_format": {"type": "json_object"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&valid_profile_json())))
        .expect(1)
        .mount(&server)
        .await;

    let text = openai_generator(&server)
        .complete(request(ResponseMode::JsonObject))
        .await
        .unwrap();

    assert_eq!(text, valid_profile_json());
}

#[tokio::test]
async fn empty_completion_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("")))
        .mount(&server)
        .await;

    let err = openai_generator(&server)
        .complete(request(ResponseMode::Text))
        .await
        .unwrap_err();

    assert!(matches!(err, GenerationError::EmptyCompletion));
}

#[tokio::test]
async fn retries_rate_limit_then_succeeds() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(move |_: &wiremock::Request| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429).set_body_string("slow down")
            } else {
                ResponseTemplate::new(200).set_body_json(completion_body("hi"))
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let text = openai_generator(&server)
        .complete(request(ResponseMode::Text))
        .await
        .unwrap();

    assert_eq!(text, "hi");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let err = openai_generator(&server)
        .complete(request(ResponseMode::Text))
        .await
        .unwrap_err();

    match err {
        GenerationError::Api { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "bad key");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn pipeline_turn_over_http() {
    let server = MockServer::start().await;
    mount_streaming_completion(&server, &["Nice ", "to ", "meet ", "you"]).await;

    let store = Arc::new(MemoryStore::new());
    let (tx, _jobs) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new(
        store,
        Arc::new(openai_generator(&server)),
        word_budgets(100, 100),
        tx,
    );
    let mut sink = Vec::new();

    let response = pipeline
        .run_turn(
            TurnRequest {
                conversation: conversation(),
                text: "Hi, I'm Ada".to_string(),
                force_distill: false,
            },
            &mut sink,
        )
        .await;

    assert_eq!(response, TurnResponse::ok("Nice to meet you"));
    assert_eq!(sink.len(), 5);
}

#[tokio::test]
async fn pipeline_maps_upstream_failure_to_500() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let (tx, _jobs) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new(
        Arc::new(MemoryStore::new()),
        Arc::new(openai_generator(&server)),
        word_budgets(100, 100),
        tx,
    );

    let response = pipeline
        .run_turn(
            TurnRequest {
                conversation: conversation(),
                text: "hello".to_string(),
                force_distill: false,
            },
            &mut mnemo_engine::NullSink,
        )
        .await;

    assert_eq!(response.status, 500);
}
