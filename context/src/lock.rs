//! Per-conversation idempotency lock.
//!
//! The lock lives inside the ledger record. Acquiring it is a conditional write
//! of the ledger with the lock set, so two turns that read the same unlocked
//! ledger cannot both win: the second write fails its version check. A held
//! lock carries a lease; a lease that ran out is treated as abandoned by a
//! crashed turn and reclaimed.

use std::time::Duration;

use thiserror::Error;

use mnemo_types::{ContextWindowMeta, ConversationKey, LockState};

use crate::ledger::{LoadedLedger, ledger_record};
use crate::store::{Condition, Store, StoreError};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("conversation {conversation} is locked by another turn")]
    Contention { conversation: String },
    #[error(transparent)]
    Store(StoreError),
}

#[derive(Debug, Clone)]
pub struct IdempotencyLock {
    lease: Duration,
}

impl IdempotencyLock {
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(120);

    #[must_use]
    pub const fn new(lease: Duration) -> Self {
        Self { lease }
    }

    #[must_use]
    pub const fn lease(&self) -> Duration {
        self.lease
    }

    /// Take the lock for `holder` and persist it before returning.
    ///
    /// Fails immediately, without waiting, if another holder's lease is live or
    /// if another turn wrote the ledger after `loaded` was read. Returns the
    /// ledger as persisted (locked, version bumped).
    pub fn try_acquire(
        &self,
        store: &dyn Store,
        conversation: &ConversationKey,
        loaded: LoadedLedger,
        holder: &str,
        now_ms: i64,
    ) -> Result<ContextWindowMeta, LockError> {
        let LoadedLedger { meta, persisted } = loaded;

        match &meta.lock {
            lock if lock.is_held_at(now_ms) => {
                tracing::info!(conversation = %conversation, "Lock contention; rejecting turn");
                return Err(LockError::Contention {
                    conversation: conversation.to_string(),
                });
            }
            LockState::Held {
                holder: stale,
                expires_at_ms,
            } => {
                tracing::warn!(
                    conversation = %conversation,
                    stale_holder = %stale,
                    expired_ms_ago = now_ms - expires_at_ms,
                    "Reclaiming lock whose lease expired"
                );
            }
            LockState::Unlocked => {}
        }

        let condition = if persisted {
            Condition::IfVersion(meta.version)
        } else {
            Condition::IfAbsent
        };
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        let locked = ContextWindowMeta {
            version: meta.version + 1,
            lock: LockState::Held {
                holder: holder.to_string(),
                expires_at_ms: now_ms.saturating_add(lease_ms),
            },
            ..meta
        };

        match store.put_conditional(ledger_record(conversation, &locked), condition) {
            Ok(()) => {
                tracing::debug!(conversation = %conversation, holder, "Lock acquired");
                Ok(locked)
            }
            Err(StoreError::ConditionFailed { .. }) => {
                tracing::info!(
                    conversation = %conversation,
                    "Ledger changed while acquiring lock; rejecting turn"
                );
                Err(LockError::Contention {
                    conversation: conversation.to_string(),
                })
            }
            Err(e) => Err(LockError::Store(e)),
        }
    }

    /// Clear the lock by writing `meta` back unlocked.
    ///
    /// `meta` must be the ledger as last persisted by this holder; the write is
    /// conditioned on its version. Returns the unlocked ledger.
    pub fn release(
        &self,
        store: &dyn Store,
        conversation: &ConversationKey,
        meta: &ContextWindowMeta,
    ) -> Result<ContextWindowMeta, StoreError> {
        let unlocked = ContextWindowMeta {
            version: meta.version + 1,
            lock: LockState::Unlocked,
            ..meta.clone()
        };
        store.put_conditional(
            ledger_record(conversation, &unlocked),
            Condition::IfVersion(meta.version),
        )?;
        tracing::debug!(conversation = %conversation, "Lock released");
        Ok(unlocked)
    }
}

impl Default for IdempotencyLock {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LEASE)
    }
}
