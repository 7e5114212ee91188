//! Turn orchestration for mnemo.
//!
//! [`Pipeline`] runs one chat turn end to end against a [`Store`] and a
//! [`Generator`]. Analysis jobs it produces are handed to the distillation
//! worker started by [`spawn_worker`], which keeps the user profile current in
//! the background.
//!
//! [`Store`]: mnemo_context::Store
//! [`Generator`]: mnemo_providers::Generator

mod config;
mod distillation;
mod errors;
mod pipeline;
mod prompts;
mod sink;

pub use config::{
    AnalysisOverrides, ApiKeys, AppConfig, ChatOverrides, ConfigError, LockConfig, MnemoConfig,
    OpenAiSection, Preset, config_path, expand_env_vars, mnemo_home,
};
pub use distillation::{Distiller, spawn_worker};
pub use errors::{DistillError, TurnError};
pub use pipeline::{Pipeline, TurnRequest, TurnResponse};
pub use prompts::{RETRY_INSTRUCTION, chat_messages, distillation_messages};
pub use sink::{ChannelSink, DeliveryStatus, NullSink, TransportEvent, TransportSink};

// Re-export the lower layers so the binary needs only this crate.
pub use mnemo_context::{self, IdempotencyLock, MemoryStore, SqliteStore, Store};
pub use mnemo_providers::{self, OpenAiConfig, OpenAiGenerator};
pub use mnemo_types::{self, ConversationKey, WindowBudgets};
