use std::sync::Arc;

use crate::{ConversationKey, StoredMessage};

/// Inclusive index range, oldest-to-newest, within a window snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub start: usize,
    pub end: usize,
}

impl BatchRange {
    #[must_use]
    pub const fn message_count(&self) -> usize {
        self.end - self.start + 1
    }
}

/// A contiguous slice of persisted messages awaiting distillation.
///
/// Jobs are message-passed to the distillation worker and never stored. Jobs cut
/// from the same snapshot share it.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub conversation: ConversationKey,
    /// Oldest message first.
    pub snapshot: Arc<[StoredMessage]>,
    pub range: BatchRange,
    /// Token ceiling for the distillation reply.
    pub response_budget: u32,
}

impl AnalysisJob {
    #[must_use]
    pub fn messages(&self) -> &[StoredMessage] {
        self.snapshot
            .get(self.range.start..=self.range.end)
            .unwrap_or_default()
    }
}
