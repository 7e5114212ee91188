//! Context-window lifecycle for a rolling conversation memory.
//!
//! This crate provides:
//! - Multi-metric token counting via tiktoken
//! - A partitioned, recency-ordered record store (in-memory and SQLite)
//! - The per-conversation ledger and its idempotency lock
//! - Window loading, reconciliation, eviction and analysis batching
//! - Structured validation of distilled profiles
//!
//! # Architecture
//!
//! ```text
//! Store (messages / ledger / profile partitions)
//! ├── ledger::load_ledger ──► lock::IdempotencyLock::try_acquire
//! ├── window::load_windows ──► Windows { chat, analysis }
//! └── reconcile::reconcile ──► eviction::admit_pair ──► batcher::apply_pair
//!                                                        └── AnalysisJob (to distillation)
//! ```
//!
//! Nothing in here performs generation. The engine crate owns the turn and
//! calls into these pieces in order.

mod batcher;
mod eviction;
mod ledger;
mod lock;
mod profile_schema;
mod reconcile;
mod sequence;
mod sqlite_store;
mod sqlite_util;
mod store;
mod token_counter;
mod window;

pub use batcher::{BatchOutcome, BatchTrigger, apply_pair, partition};
pub use eviction::{admit_pair, evict_tail_pair};
pub use ledger::{
    LEDGER_SORT_KEY, LoadedLedger, latest_profile, ledger_record, load_ledger, message_record,
    profile_record,
};
pub use lock::{IdempotencyLock, LockError};
pub use profile_schema::{ValidationError, profile_schema, validate_profile};
pub use reconcile::{Reconciliation, reconcile};
pub use sequence::SequenceGenerator;
pub use sqlite_store::SqliteStore;
pub use store::{
    Condition, MemoryStore, Page, Record, RecordBody, Store, StoreError, Write, query_recent,
};
pub use token_counter::TokenCounter;
pub use window::{Windows, load_windows};
