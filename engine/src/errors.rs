use thiserror::Error;

use mnemo_context::{LockError, StoreError};
use mnemo_providers::GenerationError;
use mnemo_types::BudgetError;

/// Why a turn was rejected or failed.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("conversation is busy with another turn")]
    LockContention,
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("generation failed: {0}")]
    Upstream(#[from] GenerationError),
}

impl TurnError {
    /// Status reported to the caller. Client-side problems are 400, everything
    /// else 500.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) | Self::LockContention => 400,
            Self::Storage(_) | Self::Upstream(_) => 500,
        }
    }
}

impl From<LockError> for TurnError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Contention { .. } => Self::LockContention,
            LockError::Store(e) => Self::Storage(e),
        }
    }
}

impl From<BudgetError> for TurnError {
    fn from(error: BudgetError) -> Self {
        Self::InvalidInput(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DistillError {
    /// Both the first reply and the corrected one failed validation.
    #[error("distillation failed: {reason}")]
    DistillationFailed { reason: String },
    #[error("distillation request failed: {0}")]
    Upstream(#[from] GenerationError),
    #[error("distillation storage failure: {0}")]
    Storage(#[from] StoreError),
}
