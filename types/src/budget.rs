//! Token budgets for the chat and analysis windows.
//!
//! A budget describes how a model's context window is carved up for one kind of
//! call. The `max_window` figure is what the ledger enforces; the other fields
//! bound the pieces that surround the window in the prompt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TokenMetric;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error(
        "chat budget inconsistent: user message ({user}) + response ({response}) must be less than the chat window ({window})"
    )]
    ChatWindowTooSmall { user: u32, response: u32, window: u32 },
    #[error(
        "analysis budget inconsistent: user message ({user}) + reply ({reply}) must be less than the analysis window ({window})"
    )]
    AnalysisWindowTooSmall { user: u32, reply: u32, window: u32 },
    #[error("{which} budget exceeds its context window ({used} > {context_window})")]
    ContextOverrun {
        which: &'static str,
        used: u32,
        context_window: u32,
    },
}

/// Budget for the call that answers the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBudget {
    pub metric: TokenMetric,
    pub context_window: u32,
    pub system_prompt: u32,
    pub response: u32,
    pub user_message: u32,
    pub wiggle_room: u32,
    pub max_window: u32,
}

/// Budget for the distillation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisBudget {
    pub metric: TokenMetric,
    pub context_window: u32,
    pub system_prompt: u32,
    pub response: u32,
    pub user_message: u32,
    pub reply: u32,
    pub wiggle_room: u32,
    pub max_window: u32,
}

impl AnalysisBudget {
    /// Largest transcript a single distillation call can carry.
    #[must_use]
    pub const fn batch_ceiling(&self) -> u32 {
        self.context_window
            .saturating_sub(self.system_prompt)
            .saturating_sub(self.response)
            .saturating_sub(self.wiggle_room)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBudgets {
    pub chat: ChatBudget,
    pub analysis: AnalysisBudget,
}

impl WindowBudgets {
    /// Budgets sized for a 4k-context model.
    #[must_use]
    pub const fn production() -> Self {
        Self {
            chat: ChatBudget {
                metric: TokenMetric::Cl100kBase,
                context_window: 4096,
                system_prompt: 92,
                response: 500,
                user_message: 500,
                wiggle_room: 15,
                max_window: 1596,
            },
            analysis: AnalysisBudget {
                metric: TokenMetric::Cl100kBase,
                context_window: 4096,
                system_prompt: 531,
                response: 1393,
                user_message: 500,
                reply: 500,
                wiggle_room: 15,
                max_window: 1596,
            },
        }
    }

    /// Tiny windows that overflow within a few turns. Useful for exercising
    /// eviction and batching by hand.
    #[must_use]
    pub const fn small() -> Self {
        let production = Self::production();
        Self {
            chat: ChatBudget {
                context_window: 1590,
                response: 20,
                user_message: 20,
                max_window: 50,
                ..production.chat
            },
            analysis: AnalysisBudget {
                user_message: 20,
                reply: 20,
                max_window: 50,
                ..production.analysis
            },
        }
    }

    /// Distinct metrics in use by either window.
    #[must_use]
    pub fn metrics(&self) -> Vec<TokenMetric> {
        if self.chat.metric == self.analysis.metric {
            vec![self.chat.metric]
        } else {
            vec![self.chat.metric, self.analysis.metric]
        }
    }

    /// Reject budgets where a single turn cannot fit inside its window.
    pub fn validate(&self) -> Result<(), BudgetError> {
        let chat = &self.chat;
        if chat.user_message.saturating_add(chat.response) >= chat.max_window {
            return Err(BudgetError::ChatWindowTooSmall {
                user: chat.user_message,
                response: chat.response,
                window: chat.max_window,
            });
        }

        let analysis = &self.analysis;
        if analysis.user_message.saturating_add(analysis.reply) >= analysis.max_window {
            return Err(BudgetError::AnalysisWindowTooSmall {
                user: analysis.user_message,
                reply: analysis.reply,
                window: analysis.max_window,
            });
        }

        let chat_used = [
            chat.system_prompt,
            chat.max_window,
            chat.user_message,
            chat.response,
            chat.wiggle_room,
        ]
        .into_iter()
        .fold(0u32, u32::saturating_add);
        if chat_used > chat.context_window {
            return Err(BudgetError::ContextOverrun {
                which: "chat",
                used: chat_used,
                context_window: chat.context_window,
            });
        }

        Ok(())
    }
}

impl Default for WindowBudgets {
    fn default() -> Self {
        Self::production()
    }
}
