//! Core domain types for mnemo.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod budget;
mod ids;
mod job;
mod ledger;
mod message;
mod metric;
mod profile;

pub use budget::{AnalysisBudget, BudgetError, ChatBudget, WindowBudgets};
pub use ids::{ConversationKey, ConversationKeyError, SequenceKey};
pub use job::{AnalysisJob, BatchRange};
pub use ledger::{ContextWindowMeta, LockState, WindowMeta};
pub use message::{Role, StoredMessage};
pub use metric::{TokenLengths, TokenMetric, UnknownMetricError, total_length};
pub use profile::{Assessment, UserProfile};
