//! Reconciliation of a loaded ledger against the current configuration.
//!
//! Between turns the operator may switch a window's metric or lower its
//! budget. Before generation the in-memory windows and ledger are brought back
//! in line: counts under a changed metric are recomputed, the chat window is
//! trimmed to its current budget, and an analysis window that no longer fits is
//! flagged for an out-of-band distillation. The persisted log is never touched.

use mnemo_types::{ContextWindowMeta, StoredMessage, TokenMetric, WindowBudgets, WindowMeta};

use crate::eviction::evict_tail_pair;
use crate::token_counter::TokenCounter;
use crate::window::Windows;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub chat_retokenized: bool,
    pub analysis_retokenized: bool,
    /// Messages evicted from the chat window to meet its budget.
    pub evicted: usize,
    /// Set when the analysis window exceeds its current budget. Carries the
    /// budget that was in force while the window accumulated.
    pub overflow: Option<u32>,
}

pub fn reconcile(
    meta: &mut ContextWindowMeta,
    windows: &mut Windows,
    budgets: &WindowBudgets,
    counter: &TokenCounter,
) -> Reconciliation {
    let metrics = budgets.metrics();
    let mut outcome = Reconciliation::default();

    if meta.chat.metric != budgets.chat.metric {
        retokenize_window(&mut windows.chat, &mut meta.chat, budgets.chat.metric, &metrics, counter);
        outcome.chat_retokenized = true;
    }
    if meta.analysis.metric != budgets.analysis.metric {
        retokenize_window(
            &mut windows.analysis,
            &mut meta.analysis,
            budgets.analysis.metric,
            &metrics,
            counter,
        );
        outcome.analysis_retokenized = true;
    }

    meta.chat.max_token_length = budgets.chat.max_window;
    let before = windows.chat.len();
    while !meta.chat.fits() && evict_tail_pair(&mut windows.chat, &mut meta.chat) {}
    outcome.evicted = before - windows.chat.len();

    let prior_max = meta.analysis.max_token_length;
    meta.analysis.max_token_length = budgets.analysis.max_window;
    if !meta.analysis.fits() {
        outcome.overflow = Some(prior_max);
    }

    if outcome != Reconciliation::default() {
        tracing::info!(
            chat_retokenized = outcome.chat_retokenized,
            analysis_retokenized = outcome.analysis_retokenized,
            evicted = outcome.evicted,
            overflow = ?outcome.overflow,
            "Reconciled ledger with current configuration"
        );
    }
    outcome
}

fn retokenize_window(
    window: &mut [StoredMessage],
    meta: &mut WindowMeta,
    metric: TokenMetric,
    metrics: &[TokenMetric],
    counter: &TokenCounter,
) {
    let totals = counter.retokenize(window, metrics);
    tracing::debug!(from = %meta.metric, to = %metric, "Retokenizing window");
    meta.metric = metric;
    meta.token_length = totals.get(&metric).copied().unwrap_or(0);
}
