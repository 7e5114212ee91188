//! Loading and encoding the per-conversation records: the ledger and the
//! latest distilled profile.

use mnemo_types::{
    ContextWindowMeta, ConversationKey, SequenceKey, StoredMessage, UserProfile, WindowBudgets,
};

use crate::store::{Record, RecordBody, Store, StoreError, query_recent};

/// The ledger partition holds exactly one record under this key.
pub const LEDGER_SORT_KEY: &str = "meta";

/// A ledger plus whether it came from the store.
///
/// A seeded ledger has never been written, so the first write must be
/// conditioned on absence rather than on a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedLedger {
    pub meta: ContextWindowMeta,
    pub persisted: bool,
}

/// Load the conversation's ledger, or seed a zeroed one from `budgets` on the
/// first turn.
pub fn load_ledger(
    store: &dyn Store,
    conversation: &ConversationKey,
    budgets: &WindowBudgets,
) -> Result<LoadedLedger, StoreError> {
    let partition = conversation.ledger_partition();
    let record = query_recent(store, &partition, 1)?.into_iter().next();

    match record.map(|r| r.body) {
        Some(RecordBody::Ledger(meta)) => Ok(LoadedLedger {
            meta,
            persisted: true,
        }),
        Some(_) => Err(StoreError::UnexpectedRecord {
            partition,
            expected: "ledger",
        }),
        None => {
            tracing::debug!(conversation = %conversation, "No ledger found; seeding a new one");
            Ok(LoadedLedger {
                meta: ContextWindowMeta::seeded(budgets),
                persisted: false,
            })
        }
    }
}

#[must_use]
pub fn ledger_record(conversation: &ConversationKey, meta: &ContextWindowMeta) -> Record {
    Record {
        partition: conversation.ledger_partition(),
        sort: LEDGER_SORT_KEY.to_string(),
        version: meta.version,
        body: RecordBody::Ledger(meta.clone()),
    }
}

#[must_use]
pub fn profile_record(
    conversation: &ConversationKey,
    sequence: &SequenceKey,
    profile: &UserProfile,
) -> Record {
    Record {
        partition: conversation.profile_partition(),
        sort: sequence.as_str().to_string(),
        version: 0,
        body: RecordBody::Profile(profile.clone()),
    }
}

/// Log entry for `message`, keyed by its sequence.
#[must_use]
pub fn message_record(message: &StoredMessage) -> Record {
    Record {
        partition: message.conversation.messages_partition(),
        sort: message.sequence.as_str().to_string(),
        version: 0,
        body: RecordBody::Message(message.clone()),
    }
}

/// Most recent profile version, or the blank profile if none was distilled yet.
pub fn latest_profile(
    store: &dyn Store,
    conversation: &ConversationKey,
) -> Result<UserProfile, StoreError> {
    let partition = conversation.profile_partition();
    match query_recent(store, &partition, 1)?
        .into_iter()
        .next()
        .map(|r| r.body)
    {
        Some(RecordBody::Profile(profile)) => Ok(profile),
        Some(_) => Err(StoreError::UnexpectedRecord {
            partition,
            expected: "profile",
        }),
        None => Ok(UserProfile::blank()),
    }
}
