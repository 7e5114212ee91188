use mnemo_types::{ContextWindowMeta, ConversationKey, StoredMessage, TokenMetric, WindowMeta};

use crate::store::{RecordBody, Store, StoreError, query_recent};
use crate::token_counter::TokenCounter;

/// In-memory chat and analysis windows. Index 0 is the newest message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Windows {
    pub chat: Vec<StoredMessage>,
    pub analysis: Vec<StoredMessage>,
}

/// Rebuild both windows from one newest-first read of the message log.
///
/// Both windows are prefixes of the same fetch. Messages written before a
/// metric came into use carry no length for it; the loaded copies are measured
/// under every metric in `metrics` and both ledger metrics, so counts taken
/// from them are never silently zero. If the log holds fewer messages than the
/// ledger claims, the affected window is clamped to what exists (keeping the
/// count even) and its token length recomputed from the messages themselves.
pub fn load_windows(
    store: &dyn Store,
    conversation: &ConversationKey,
    meta: &mut ContextWindowMeta,
    metrics: &[TokenMetric],
    counter: &TokenCounter,
) -> Result<Windows, StoreError> {
    let wanted = meta.fetch_count() as usize;
    if wanted == 0 {
        return Ok(Windows::default());
    }

    let partition = conversation.messages_partition();
    let mut messages = query_recent(store, &partition, wanted)?
        .into_iter()
        .map(|record| match record.body {
            RecordBody::Message(message) => Ok(message),
            _ => Err(StoreError::UnexpectedRecord {
                partition: partition.clone(),
                expected: "message",
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut measured = metrics.to_vec();
    for metric in [meta.chat.metric, meta.analysis.metric] {
        if !measured.contains(&metric) {
            measured.push(metric);
        }
    }
    let touched = counter.measure_missing(&mut messages, &measured);
    if touched > 0 {
        tracing::debug!(
            conversation = %conversation,
            messages = touched,
            "Measured loaded messages under newly configured metrics"
        );
    }

    if messages.len() < wanted {
        tracing::warn!(
            conversation = %conversation,
            expected = wanted,
            found = messages.len(),
            "Message log is shorter than the ledger; clamping windows"
        );
    }

    let chat = take_window(&messages, &mut meta.chat, "chat");
    let analysis = take_window(&messages, &mut meta.analysis, "analysis");
    Ok(Windows { chat, analysis })
}

fn take_window(
    messages: &[StoredMessage],
    meta: &mut WindowMeta,
    name: &'static str,
) -> Vec<StoredMessage> {
    let wanted = meta.message_count as usize;
    if messages.len() >= wanted {
        return messages[..wanted].to_vec();
    }

    let available = messages.len() & !1;
    let window = messages[..available].to_vec();
    let recomputed = window
        .iter()
        .map(|m| m.length(meta.metric))
        .fold(0u32, u32::saturating_add);
    tracing::debug!(
        window = name,
        from = meta.message_count,
        to = available,
        token_length = recomputed,
        "Clamped window"
    );
    meta.message_count = available as u32;
    meta.token_length = recomputed;
    window
}
