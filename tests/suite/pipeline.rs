//! End-to-end turn scenarios over the in-memory store

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};

use mnemo_engine::mnemo_context::{MemoryStore, latest_profile};
use mnemo_engine::mnemo_providers::{GenerationError, ResponseMode};
use mnemo_engine::mnemo_types::{LockState, TokenMetric, UserProfile};
use mnemo_engine::{
    DeliveryStatus, Distiller, IdempotencyLock, NullSink, Pipeline, RETRY_INSTRUCTION,
    TransportEvent, TurnRequest, TurnResponse, spawn_worker,
};

use crate::common::{
    ScriptedGenerator, conversation, ledger, pipeline_harness, stored_message_count,
    valid_profile_json, word_budgets, words,
};

fn request(text: impl Into<String>) -> TurnRequest {
    TurnRequest {
        conversation: conversation(),
        text: text.into(),
        force_distill: false,
    }
}

#[tokio::test]
async fn first_turn_seeds_ledger_with_pair() {
    let budgets = word_budgets(100, 100);
    let h = pipeline_harness(ScriptedGenerator::new().with_chat([words("r", 15)]), budgets);
    let mut sink = Vec::new();

    let response = h.pipeline.run_turn(request(words("u", 10)), &mut sink).await;

    assert_eq!(response, TurnResponse::ok(words("r", 15)));
    let meta = ledger(h.store.as_ref(), &budgets);
    assert_eq!(meta.chat.message_count, 2);
    assert_eq!(meta.chat.token_length, 25);
    assert_eq!(meta.lock, LockState::Unlocked);

    let streamed: String = sink
        .iter()
        .filter(|e| e.status == DeliveryStatus::Partial)
        .map(|e| e.fragment.as_str())
        .collect();
    assert_eq!(streamed, words("r", 15));
    assert_eq!(sink.last(), Some(&TransportEvent::complete()));
}

#[tokio::test]
async fn chat_window_evicts_oldest_pair_and_stays_in_budget() {
    let budgets = word_budgets(100, 400);
    let generator = ScriptedGenerator::new().with_chat([
        words("A", 25),
        words("B", 20),
        words("C", 10),
        words("D", 5),
    ]);
    let h = pipeline_harness(generator, budgets);

    let turns = [(words("a", 25), 50, 2), (words("b", 20), 90, 4), (words("c", 10), 60, 4)];
    for (text, chat_tokens, chat_messages) in turns {
        let response = h.pipeline.run_turn(request(text), &mut NullSink).await;
        assert!(response.is_success(), "{response:?}");

        let meta = ledger(h.store.as_ref(), &budgets);
        assert_eq!(meta.chat.token_length, chat_tokens);
        assert_eq!(meta.chat.message_count, chat_messages);
        assert!(meta.chat.token_length <= meta.chat.max_token_length);
        assert_eq!(meta.chat.message_count % 2, 0);
    }

    h.pipeline
        .run_turn(request(words("d", 5)), &mut NullSink)
        .await;

    // The fourth prompt replays the two surviving pairs, oldest first.
    let prompt = &h.generator.requests()[3].messages;
    let contents: Vec<&str> = prompt[1..].iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        [
            words("b", 20),
            words("B", 20),
            words("c", 10),
            words("C", 10),
            words("d", 5)
        ]
    );
    // The log itself is append-only.
    assert_eq!(stored_message_count(h.store.as_ref()), 8);
}

#[tokio::test]
async fn switching_chat_metric_evicts_one_pair_on_later_turns() {
    let mut roomy = word_budgets(1000, 2000);
    roomy.chat.metric = TokenMetric::Cl100kBase;
    roomy.chat.user_message = 200;
    roomy.chat.response = 200;
    roomy.analysis.metric = TokenMetric::Cl100kBase;
    roomy.analysis.user_message = 200;
    roomy.analysis.reply = 200;

    let mut switched = roomy;
    switched.chat.metric = TokenMetric::Words;
    switched.chat.max_window = 100;
    switched.chat.user_message = 40;
    switched.chat.response = 40;

    let store = Arc::new(MemoryStore::new());
    let (tx, _jobs) = mpsc::unbounded_channel();
    let before = Pipeline::new(
        store.clone(),
        Arc::new(ScriptedGenerator::new().with_chat([words("a", 20), words("b", 20)])),
        roomy,
        tx.clone(),
    );
    for prefix in ["p", "q"] {
        let response = before.run_turn(request(words(prefix, 20)), &mut NullSink).await;
        assert!(response.is_success(), "{response:?}");
    }

    let after = Pipeline::new(
        store.clone(),
        Arc::new(ScriptedGenerator::new().with_chat([words("c", 20), words("d", 20)])),
        switched,
        tx,
    );

    let response = after.run_turn(request(words("r", 20)), &mut NullSink).await;
    assert!(response.is_success(), "{response:?}");
    let meta = ledger(store.as_ref(), &switched);
    assert_eq!(meta.chat.metric, TokenMetric::Words);
    assert_eq!((meta.chat.message_count, meta.chat.token_length), (4, 80));

    // The oldest pair in the window was stored before `words` was in use.
    let response = after.run_turn(request(words("s", 20)), &mut NullSink).await;
    assert!(response.is_success(), "{response:?}");
    let meta = ledger(store.as_ref(), &switched);
    assert_eq!((meta.chat.message_count, meta.chat.token_length), (4, 80));
    assert_eq!(stored_message_count(store.as_ref()), 8);
}

#[tokio::test]
async fn analysis_overflow_emits_window_and_pair_as_one_batch() {
    let mut budgets = word_budgets(400, 50);
    budgets.analysis.user_message = 20;
    budgets.analysis.reply = 20;
    let generator =
        ScriptedGenerator::new().with_chat([words("A", 15), words("B", 10), words("C", 5)]);
    let mut h = pipeline_harness(generator, budgets);

    for (text, expected) in [(words("a", 10), 25), (words("b", 10), 45)] {
        h.pipeline.run_turn(request(text), &mut NullSink).await;
        assert_eq!(ledger(h.store.as_ref(), &budgets).analysis.token_length, expected);
    }
    assert!(h.jobs.try_recv().is_err());

    h.pipeline
        .run_turn(request(words("c", 5)), &mut NullSink)
        .await;

    let job = h.jobs.try_recv().unwrap();
    assert!(h.jobs.try_recv().is_err());
    let batch: Vec<&str> = job.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        batch,
        [
            words("a", 10),
            words("A", 15),
            words("b", 10),
            words("B", 10),
            words("c", 5),
            words("C", 5)
        ]
    );
    assert_eq!(job.response_budget, 500);

    let meta = ledger(h.store.as_ref(), &budgets);
    assert_eq!(meta.analysis.token_length, 0);
    assert_eq!(meta.analysis.message_count, 0);
}

#[tokio::test]
async fn concurrent_turn_is_rejected_without_touching_ledger() {
    let budgets = word_budgets(100, 100);
    let gate = Arc::new(Notify::new());
    let generator = ScriptedGenerator::new()
        .with_chat([words("r", 3)])
        .gated(Arc::clone(&gate));
    let h = pipeline_harness(generator, budgets);

    let mut first_sink = Vec::new();
    let first = h.pipeline.run_turn(request("hello"), &mut first_sink);
    let second = async {
        let before = ledger(h.store.as_ref(), &budgets);
        let response = h.pipeline.run_turn(request("hello again"), &mut NullSink).await;
        let after = ledger(h.store.as_ref(), &budgets);
        gate.notify_one();
        (response, before, after)
    };

    let (first, (second, before, after)) = tokio::join!(first, second);

    assert_eq!(second.status, 400);
    assert!(matches!(before.lock, LockState::Held { .. }));
    assert_eq!(before, after);

    assert_eq!(first, TurnResponse::ok(words("r", 3)));
    let meta = ledger(h.store.as_ref(), &budgets);
    assert_eq!(meta.lock, LockState::Unlocked);
    assert_eq!(meta.chat.message_count, 2);
    assert_eq!(stored_message_count(h.store.as_ref()), 2);
}

#[tokio::test]
async fn reclaimed_lock_fails_the_stale_turn_at_sync() {
    let budgets = word_budgets(100, 100);
    let store = Arc::new(MemoryStore::new());
    let gate = Arc::new(Notify::new());
    let no_lease = IdempotencyLock::new(Duration::ZERO);

    let (tx, _jobs) = mpsc::unbounded_channel();
    let stale = Pipeline::new(
        store.clone(),
        Arc::new(
            ScriptedGenerator::new()
                .with_chat([words("s", 3)])
                .gated(Arc::clone(&gate)),
        ),
        budgets,
        tx.clone(),
    )
    .with_lock(no_lease.clone());
    let fresh = Pipeline::new(
        store.clone(),
        Arc::new(ScriptedGenerator::new().with_chat([words("f", 3)])),
        budgets,
        tx,
    )
    .with_lock(no_lease);

    let mut stale_sink = NullSink;
    let mut fresh_sink = NullSink;
    let stale_turn = stale.run_turn(request("first"), &mut stale_sink);
    let fresh_turn = async {
        let response = fresh.run_turn(request("second"), &mut fresh_sink).await;
        gate.notify_one();
        response
    };
    let (stale_response, fresh_response) = tokio::join!(stale_turn, fresh_turn);

    assert!(fresh_response.is_success());
    assert_eq!(stale_response.status, 500);

    let meta = ledger(store.as_ref(), &budgets);
    assert_eq!(meta.lock, LockState::Unlocked);
    assert_eq!(meta.chat.message_count, 2);
    assert_eq!(stored_message_count(store.as_ref()), 2);
}

#[tokio::test]
async fn upstream_error_is_500_and_nothing_is_recorded() {
    let budgets = word_budgets(100, 100);
    let generator = ScriptedGenerator::new().with_chat_error(GenerationError::Api {
        status: 500,
        body: "internal".to_string(),
    });
    let h = pipeline_harness(generator, budgets);

    let response = h.pipeline.run_turn(request("hello"), &mut NullSink).await;

    assert_eq!(response.status, 500);
    assert!(response.message.contains("internal"));
    let meta = ledger(h.store.as_ref(), &budgets);
    assert_eq!(meta.lock, LockState::Unlocked);
    assert_eq!(meta.chat.message_count, 0);
    assert_eq!(stored_message_count(h.store.as_ref()), 0);
}

#[tokio::test]
async fn forced_distillation_recovers_from_one_malformed_reply() {
    let budgets = word_budgets(100, 100);
    let store = Arc::new(MemoryStore::new());
    let generator = Arc::new(
        ScriptedGenerator::new()
            .with_chat([words("r", 4)])
            .with_completions(["Sure! Here is the profile: {".to_string(), valid_profile_json()]),
    );

    let (jobs, worker) = spawn_worker(Distiller::new(store.clone(), Arc::clone(&generator)));
    let pipeline = Pipeline::new(store.clone(), Arc::clone(&generator), budgets, jobs);

    let response = pipeline
        .run_turn(
            TurnRequest {
                conversation: conversation(),
                text: "I moved to London last year".to_string(),
                force_distill: true,
            },
            &mut NullSink,
        )
        .await;
    assert!(response.is_success());

    drop(pipeline);
    worker.await.unwrap();

    let profile = latest_profile(store.as_ref(), &conversation()).unwrap();
    assert_eq!(profile.basic_info["current_location"], "London");
    assert_eq!(profile.traits[0].strength, 80);

    let requests = generator.requests();
    let distills: Vec<_> = requests
        .iter()
        .filter(|r| r.mode == ResponseMode::JsonObject)
        .collect();
    assert_eq!(distills.len(), 2);
    let retry = &distills[1].messages;
    assert_eq!(retry.last().unwrap().content, RETRY_INSTRUCTION);
    assert!(distills[0].messages[1].content.contains("I moved to London last year"));

    let meta = ledger(store.as_ref(), &budgets);
    assert_eq!(meta.analysis.message_count, 0);
}

#[tokio::test]
async fn failed_distillation_leaves_profile_and_turn_intact() {
    let budgets = word_budgets(100, 100);
    let store = Arc::new(MemoryStore::new());
    let generator = Arc::new(
        ScriptedGenerator::new()
            .with_chat([words("r", 4)])
            .with_completions(["[]".to_string(), "{}".to_string()]),
    );

    let (jobs, worker) = spawn_worker(Distiller::new(store.clone(), Arc::clone(&generator)));
    let pipeline = Pipeline::new(store.clone(), Arc::clone(&generator), budgets, jobs);

    let response = pipeline
        .run_turn(
            TurnRequest {
                conversation: conversation(),
                text: "hello".to_string(),
                force_distill: true,
            },
            &mut NullSink,
        )
        .await;
    assert!(response.is_success());

    drop(pipeline);
    worker.await.unwrap();

    assert_eq!(
        latest_profile(store.as_ref(), &conversation()).unwrap(),
        UserProfile::blank()
    );
    assert_eq!(stored_message_count(store.as_ref()), 2);
}
