//! Token counting using tiktoken.
//!
//! Each metric maps to one tiktoken encoding (or to a plain word count). The
//! encoders are expensive to initialize, so each is created once per process and
//! shared. If an encoder fails to load, counts for that metric fall back to byte
//! length, which over-estimates and therefore keeps windows inside budget.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base, p50k_base, r50k_base};

use mnemo_types::{StoredMessage, TokenLengths, TokenMetric};

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static P50K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static R50K: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_encoder(metric: TokenMetric) -> Option<&'static CoreBPE> {
    let cell = match metric {
        TokenMetric::Cl100kBase => &CL100K,
        TokenMetric::O200kBase => &O200K,
        TokenMetric::P50kBase => &P50K,
        TokenMetric::R50kBase => &R50K,
        TokenMetric::Words => return None,
    };
    cell.get_or_init(|| load_encoder(metric)).as_ref()
}

fn load_encoder(metric: TokenMetric) -> Option<CoreBPE> {
    let loaded = match metric {
        TokenMetric::Cl100kBase => cl100k_base(),
        TokenMetric::O200kBase => o200k_base(),
        TokenMetric::P50kBase => p50k_base(),
        TokenMetric::R50kBase => r50k_base(),
        TokenMetric::Words => return None,
    };
    match loaded {
        Ok(encoder) => Some(encoder),
        Err(e) => {
            tracing::error!(
                metric = %metric,
                "Failed to initialize tiktoken encoder: {e}. Falling back to byte-length estimates."
            );
            None
        }
    }
}

/// Stateless facade over every supported metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCounter;

impl TokenCounter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Length of `text` under one metric.
    #[must_use]
    pub fn length(&self, text: &str, metric: TokenMetric) -> u32 {
        let len = match metric {
            TokenMetric::Words => text.split_whitespace().count(),
            _ => match get_encoder(metric) {
                Some(encoder) => encoder.encode_ordinary(text).len(),
                None => text.len(),
            },
        };

        u32::try_from(len).unwrap_or(u32::MAX)
    }

    /// Lengths of `text` under each of `metrics`.
    #[must_use]
    pub fn lengths(&self, text: &str, metrics: &[TokenMetric]) -> TokenLengths {
        metrics
            .iter()
            .map(|&metric| (metric, self.length(text, metric)))
            .collect()
    }

    /// Measure each message under any of `metrics` it has no length for yet.
    ///
    /// Existing lengths are kept. Returns how many messages were touched.
    pub fn measure_missing(&self, messages: &mut [StoredMessage], metrics: &[TokenMetric]) -> usize {
        let mut touched = 0;
        for message in messages.iter_mut() {
            let mut changed = false;
            for &metric in metrics {
                if !message.token_lengths.contains_key(&metric) {
                    let len = self.length(&message.content, metric);
                    message.token_lengths.insert(metric, len);
                    changed = true;
                }
            }
            touched += usize::from(changed);
        }
        touched
    }

    /// Refresh each message's lengths for `metrics` in place and return the
    /// per-metric totals across all of them.
    ///
    /// Lengths under other metrics are left as they were.
    pub fn retokenize(&self, messages: &mut [StoredMessage], metrics: &[TokenMetric]) -> TokenLengths {
        let mut totals: TokenLengths = metrics.iter().map(|&m| (m, 0)).collect();
        for message in messages.iter_mut() {
            for &metric in metrics {
                let len = self.length(&message.content, metric);
                message.token_lengths.insert(metric, len);
                if let Some(total) = totals.get_mut(&metric) {
                    *total = total.saturating_add(len);
                }
            }
        }
        totals
    }
}
