use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationKeyError {
    #[error("{field} id must not be empty")]
    Empty { field: &'static str },
    #[error("{field} id must not contain '#'")]
    Separator { field: &'static str },
}

/// Identifies one conversation: an account, the end user, and the assistant persona.
///
/// Every persisted record for a conversation lives under one of three partitions
/// derived from this key (messages, ledger, profile).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawConversationKey")]
pub struct ConversationKey {
    account: String,
    user: String,
    assistant: String,
}

/// Wire shape of [`ConversationKey`], checked on the way in.
#[derive(Deserialize)]
struct RawConversationKey {
    account: String,
    user: String,
    assistant: String,
}

impl TryFrom<RawConversationKey> for ConversationKey {
    type Error = ConversationKeyError;

    fn try_from(raw: RawConversationKey) -> Result<Self, Self::Error> {
        Self::new(raw.account, raw.user, raw.assistant)
    }
}

impl ConversationKey {
    pub fn new(
        account: impl Into<String>,
        user: impl Into<String>,
        assistant: impl Into<String>,
    ) -> Result<Self, ConversationKeyError> {
        let account = checked("account", account.into())?;
        let user = checked("user", user.into())?;
        let assistant = checked("assistant", assistant.into())?;
        Ok(Self {
            account,
            user,
            assistant,
        })
    }

    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn assistant(&self) -> &str {
        &self.assistant
    }

    #[must_use]
    pub fn messages_partition(&self) -> String {
        format!("{self}{SEPARATOR}messages")
    }

    #[must_use]
    pub fn ledger_partition(&self) -> String {
        format!("{self}{SEPARATOR}ledger")
    }

    #[must_use]
    pub fn profile_partition(&self) -> String {
        format!("{self}{SEPARATOR}profile")
    }
}

fn checked(field: &'static str, value: String) -> Result<String, ConversationKeyError> {
    if value.trim().is_empty() {
        return Err(ConversationKeyError::Empty { field });
    }
    if value.contains(SEPARATOR) {
        return Err(ConversationKeyError::Separator { field });
    }
    Ok(value)
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.account, self.user, self.assistant
        )
    }
}

/// Recency-ordered sort key. Lexicographic order is write order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceKey(String);

impl SequenceKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
