//! SQLite-backed store and pipeline on real files

use std::sync::Arc;

use tokio::sync::mpsc;

use mnemo_engine::mnemo_context::{
    LEDGER_SORT_KEY, SqliteStore, Store, latest_profile, ledger_record, load_ledger,
    profile_record, query_recent,
};
use mnemo_engine::mnemo_types::{ContextWindowMeta, SequenceKey, UserProfile};
use mnemo_engine::{NullSink, Pipeline, TurnRequest};

use crate::common::{ScriptedGenerator, conversation, stored_message_count, word_budgets, words};

#[test]
fn creates_missing_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("mnemo.db");

    SqliteStore::open(&path).unwrap();

    assert!(path.exists());
}

#[cfg(unix)]
#[test]
fn database_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("private").join("mnemo.db");
    SqliteStore::open(&path).unwrap();

    let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
    assert_eq!(file_mode, 0o600);
    let dir_mode = std::fs::metadata(path.parent().unwrap())
        .unwrap()
        .permissions()
        .mode()
        & 0o777;
    assert_eq!(dir_mode & 0o077, 0);
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mnemo.db");
    let budgets = word_budgets(100, 100);
    let key = conversation();

    {
        let store = SqliteStore::open(&path).unwrap();
        let meta = ContextWindowMeta::seeded(&budgets);
        store.put(ledger_record(&key, &meta)).unwrap();
        let mut profile = UserProfile::blank();
        profile.summary = "persisted".to_string();
        store
            .put(profile_record(&key, &SequenceKey::new("2024-01-01T00:00:00.000000Z"), &profile))
            .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let loaded = load_ledger(&store, &key, &budgets).unwrap();
    assert!(loaded.persisted);
    assert_eq!(latest_profile(&store, &key).unwrap().summary, "persisted");

    let records = query_recent(&store, &key.ledger_partition(), 5).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sort, LEDGER_SORT_KEY);
}

#[test]
fn newest_profile_wins() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("mnemo.db")).unwrap();
    let key = conversation();

    for (sequence, summary) in [
        ("2024-01-01T00:00:00.000002Z", "newer"),
        ("2024-01-01T00:00:00.000001Z", "older"),
    ] {
        let mut profile = UserProfile::blank();
        profile.summary = summary.to_string();
        store
            .put(profile_record(&key, &SequenceKey::new(sequence), &profile))
            .unwrap();
    }

    assert_eq!(latest_profile(&store, &key).unwrap().summary, "newer");
}

#[tokio::test]
async fn turns_accumulate_across_process_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mnemo.db");
    let budgets = word_budgets(100, 100);

    for reply in ["R", "S"] {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&path).unwrap());
        let (tx, _jobs) = mpsc::unbounded_channel();
        let generator = Arc::new(ScriptedGenerator::new().with_chat([words(reply, 10)]));
        let pipeline = Pipeline::new(Arc::clone(&store), generator, budgets, tx);

        let response = pipeline
            .run_turn(
                TurnRequest {
                    conversation: conversation(),
                    text: words("u", 10),
                    force_distill: false,
                },
                &mut NullSink,
            )
            .await;
        assert!(response.is_success(), "{response:?}");
    }

    let store = SqliteStore::open(&path).unwrap();
    let meta = load_ledger(&store, &conversation(), &budgets).unwrap().meta;
    assert_eq!(meta.chat.message_count, 4);
    assert_eq!(meta.chat.token_length, 40);
    assert_eq!(stored_message_count(&store), 4);
}
