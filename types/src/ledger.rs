use serde::{Deserialize, Serialize};

use crate::{TokenMetric, WindowBudgets};

/// Exclusive-use flag for a conversation.
///
/// A held lock carries a lease so that a turn that died mid-flight does not
/// stall the conversation forever.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockState {
    #[default]
    Unlocked,
    Held { holder: String, expires_at_ms: i64 },
}

impl LockState {
    /// True when the lock is held and its lease has not run out at `now_ms`.
    #[must_use]
    pub fn is_held_at(&self, now_ms: i64) -> bool {
        match self {
            LockState::Unlocked => false,
            LockState::Held { expires_at_ms, .. } => *expires_at_ms > now_ms,
        }
    }
}

/// Counters for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMeta {
    pub metric: TokenMetric,
    pub token_length: u32,
    pub message_count: u32,
    pub max_token_length: u32,
}

impl WindowMeta {
    #[must_use]
    pub const fn empty(metric: TokenMetric, max_token_length: u32) -> Self {
        Self {
            metric,
            token_length: 0,
            message_count: 0,
            max_token_length,
        }
    }

    #[must_use]
    pub const fn fits(&self) -> bool {
        self.token_length <= self.max_token_length
    }

    pub fn reset(&mut self) {
        self.token_length = 0;
        self.message_count = 0;
    }
}

/// The per-conversation ledger: lock flag plus counters for both windows.
///
/// This is a value type. The pipeline threads it through a turn and writes it
/// back at defined checkpoints; `version` increases on every persisted write and
/// is the compare-and-swap token for the next one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindowMeta {
    pub version: u64,
    pub lock: LockState,
    pub chat: WindowMeta,
    pub analysis: WindowMeta,
}

impl ContextWindowMeta {
    /// Zeroed ledger for a conversation that has never been written.
    #[must_use]
    pub fn seeded(budgets: &WindowBudgets) -> Self {
        Self {
            version: 0,
            lock: LockState::Unlocked,
            chat: WindowMeta::empty(budgets.chat.metric, budgets.chat.max_window),
            analysis: WindowMeta::empty(budgets.analysis.metric, budgets.analysis.max_window),
        }
    }

    /// Number of most-recent messages needed to rebuild both windows.
    #[must_use]
    pub fn fetch_count(&self) -> u32 {
        self.chat.message_count.max(self.analysis.message_count)
    }
}
