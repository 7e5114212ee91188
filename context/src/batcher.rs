//! Analysis-window batching.
//!
//! Each turn the new pair is offered to the analysis window. Depending on the
//! ledger and the caller, the accumulated window is either kept growing or cut
//! into distillation jobs and reset.

use std::sync::Arc;

use mnemo_types::{AnalysisJob, BatchRange, ConversationKey, StoredMessage, WindowMeta, total_length};

/// Why the analysis window was flushed this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTrigger {
    /// The reconciler found the window over a lowered budget. Carries the
    /// budget in force when the window accumulated; it is reported in logs
    /// only. Jobs are always sized by the distillation call's ceiling, which
    /// bounds what one call can read whatever the window budget was.
    OverflowReflect { prior_max: u32 },
    /// The new pair would push the window over its budget.
    NaturalOverflow,
    /// The caller asked for distillation.
    ForcedReflect,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub trigger: Option<BatchTrigger>,
    pub jobs: Vec<AnalysisJob>,
}

/// Split per-message lengths (oldest first) into contiguous ranges whose sums
/// stay within `ceiling`.
///
/// A message longer than `ceiling` on its own gets a range to itself.
#[must_use]
pub fn partition(lengths: &[u32], ceiling: u32) -> Vec<BatchRange> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut sum = 0u64;

    for (index, &len) in lengths.iter().enumerate() {
        if index > start && sum + u64::from(len) > u64::from(ceiling) {
            ranges.push(BatchRange {
                start,
                end: index - 1,
            });
            start = index;
            sum = 0;
        }
        sum += u64::from(len);
    }

    if !lengths.is_empty() {
        ranges.push(BatchRange {
            start,
            end: lengths.len() - 1,
        });
    }
    ranges
}

/// Offer this turn's pair to the analysis window.
///
/// `pair` is `[user, assistant]`, or `None` when the turn produced no new
/// messages (a forced flush with empty input). Triggers are evaluated in
/// priority order: overflow reflect, natural overflow, forced reflect. When
/// none fires the pair is prepended and no job is produced.
///
/// Every flush is split by `ceiling`, the transcript allowance of one
/// distillation call, never by the window's own budget.
#[allow(clippy::too_many_arguments)]
pub fn apply_pair(
    window: &mut Vec<StoredMessage>,
    meta: &mut WindowMeta,
    pair: Option<[StoredMessage; 2]>,
    overflow: Option<u32>,
    force: bool,
    conversation: &ConversationKey,
    ceiling: u32,
    response_budget: u32,
) -> BatchOutcome {
    let pair_length = pair.as_ref().map_or(0, |p| {
        total_length(p.iter().map(|m| &m.token_lengths), meta.metric)
    });

    let trigger = if let Some(prior_max) = overflow {
        Some(BatchTrigger::OverflowReflect { prior_max })
    } else if pair.is_some() && meta.token_length.saturating_add(pair_length) > meta.max_token_length
    {
        Some(BatchTrigger::NaturalOverflow)
    } else if force {
        Some(BatchTrigger::ForcedReflect)
    } else {
        None
    };

    let Some(trigger) = trigger else {
        if let Some([user, assistant]) = pair {
            window.splice(0..0, [assistant, user]);
            meta.token_length = meta.token_length.saturating_add(pair_length);
            meta.message_count += 2;
        }
        return BatchOutcome::default();
    };

    // Oldest first from here on.
    let mut snapshot: Vec<StoredMessage> = window.drain(..).rev().collect();
    meta.reset();

    match (trigger, pair) {
        (BatchTrigger::OverflowReflect { .. }, Some([user, assistant])) => {
            meta.token_length = pair_length;
            meta.message_count = 2;
            window.extend([assistant, user]);
        }
        (_, Some(pair)) => snapshot.extend(pair),
        (_, None) => {}
    }

    let lengths: Vec<u32> = snapshot.iter().map(|m| m.length(meta.metric)).collect();
    let ranges = partition(&lengths, ceiling);
    let snapshot: Arc<[StoredMessage]> = snapshot.into();
    let jobs: Vec<AnalysisJob> = ranges
        .into_iter()
        .map(|range| AnalysisJob {
            conversation: conversation.clone(),
            snapshot: Arc::clone(&snapshot),
            range,
            response_budget,
        })
        .collect();

    tracing::info!(
        conversation = %conversation,
        trigger = ?trigger,
        messages = snapshot.len(),
        batches = jobs.len(),
        "Analysis window flushed"
    );

    BatchOutcome {
        trigger: Some(trigger),
        jobs,
    }
}
