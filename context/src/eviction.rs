//! Sliding-window eviction for the chat window.
//!
//! Messages enter and leave as user+assistant pairs, so the tail pair is the
//! unit of eviction and the message count stays even.

use mnemo_types::{StoredMessage, WindowMeta, total_length};

/// Drop the oldest pair from `window`, updating the counters. Returns false if
/// the window was already empty.
pub fn evict_tail_pair(window: &mut Vec<StoredMessage>, meta: &mut WindowMeta) -> bool {
    if window.is_empty() {
        return false;
    }
    let keep = window.len().saturating_sub(2);
    let freed = total_length(window[keep..].iter().map(|m| &m.token_lengths), meta.metric);
    let removed = window.len() - keep;
    window.truncate(keep);

    meta.token_length = meta.token_length.saturating_sub(freed);
    meta.message_count = meta.message_count.saturating_sub(removed as u32);
    if window.is_empty() {
        // Counters may have drifted from the messages; an empty window is zero.
        meta.token_length = 0;
        meta.message_count = 0;
    }
    true
}

/// Evict from the tail until `pair` fits, then prepend it.
///
/// `pair` is `[user, assistant]` in write order; after insertion the assistant
/// reply sits at index 0. Returns the number of messages evicted.
pub fn admit_pair(
    window: &mut Vec<StoredMessage>,
    meta: &mut WindowMeta,
    pair: [StoredMessage; 2],
) -> usize {
    let pair_length = total_length(pair.iter().map(|m| &m.token_lengths), meta.metric);
    let before = window.len();

    while meta.token_length.saturating_add(pair_length) > meta.max_token_length
        && evict_tail_pair(window, meta)
    {}
    let evicted = before - window.len();

    let [user, assistant] = pair;
    window.splice(0..0, [assistant, user]);
    meta.token_length = meta.token_length.saturating_add(pair_length);
    meta.message_count += 2;

    if !meta.fits() {
        tracing::warn!(
            token_length = meta.token_length,
            max = meta.max_token_length,
            "New pair alone exceeds the chat window"
        );
    }
    evicted
}
