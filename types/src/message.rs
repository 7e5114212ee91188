use serde::{Deserialize, Serialize};

use crate::{ConversationKey, SequenceKey, TokenLengths, TokenMetric};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry of the append-only message log.
///
/// Messages are immutable once written. Token lengths are computed at write time
/// for every metric in use. Loaded copies are measured under metrics configured
/// later, and the reconciler may refresh them when a window's metric changes,
/// but the persisted record is never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub content: String,
    pub role: Role,
    pub token_lengths: TokenLengths,
    pub conversation: ConversationKey,
    pub sequence: SequenceKey,
}

impl StoredMessage {
    /// Length under `metric`, or zero when the message was never measured with it.
    #[must_use]
    pub fn length(&self, metric: TokenMetric) -> u32 {
        self.token_lengths.get(&metric).copied().unwrap_or(0)
    }
}
