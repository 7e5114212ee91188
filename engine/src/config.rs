use serde::Deserialize;
use std::{env, fmt, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

use mnemo_types::{BudgetError, TokenMetric, WindowBudgets};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LEASE_SECS: u64 = 120;

#[derive(Debug, Default, Deserialize)]
pub struct MnemoConfig {
    pub app: Option<AppConfig>,
    pub api_keys: Option<ApiKeys>,
    pub openai: Option<OpenAiSection>,
    /// Overrides applied on top of the preset's chat budget.
    pub chat: Option<ChatOverrides>,
    /// Overrides applied on top of the preset's analysis budget.
    pub analysis: Option<AnalysisOverrides>,
    pub lock: Option<LockConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    #[default]
    Production,
    /// Tiny windows that overflow within a few turns.
    Small,
}

impl Preset {
    #[must_use]
    pub const fn budgets(self) -> WindowBudgets {
        match self {
            Self::Production => WindowBudgets::production(),
            Self::Small => WindowBudgets::small(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    /// Model answering the user.
    pub model: Option<String>,
    /// Model producing profiles. Defaults to `model`.
    pub distill_model: Option<String>,
    /// SQLite database file. Defaults to `~/.mnemo/mnemo.db`.
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub preset: Preset,
}

#[derive(Default, Deserialize)]
pub struct ApiKeys {
    pub openai: Option<String>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeys")
            .field(
                "openai",
                &if self.openai.is_some() {
                    "[REDACTED]"
                } else {
                    "None"
                },
            )
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAiSection {
    /// Alternate API root, e.g. a proxy.
    pub base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatOverrides {
    pub metric: Option<TokenMetric>,
    pub context_window: Option<u32>,
    pub system_prompt: Option<u32>,
    pub response: Option<u32>,
    pub user_message: Option<u32>,
    pub wiggle_room: Option<u32>,
    pub max_window: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalysisOverrides {
    pub metric: Option<TokenMetric>,
    pub context_window: Option<u32>,
    pub system_prompt: Option<u32>,
    pub response: Option<u32>,
    pub user_message: Option<u32>,
    pub reply: Option<u32>,
    pub wiggle_room: Option<u32>,
    pub max_window: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LockConfig {
    /// Seconds before an unreleased lock is considered abandoned.
    pub lease_secs: Option<u64>,
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

impl MnemoConfig {
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Preset budgets with the `[chat]` and `[analysis]` overrides applied.
    pub fn budgets(&self) -> Result<WindowBudgets, BudgetError> {
        let preset = self.app.as_ref().map(|app| app.preset).unwrap_or_default();
        let mut budgets = preset.budgets();

        if let Some(chat) = &self.chat {
            let b = &mut budgets.chat;
            b.metric = chat.metric.unwrap_or(b.metric);
            b.context_window = chat.context_window.unwrap_or(b.context_window);
            b.system_prompt = chat.system_prompt.unwrap_or(b.system_prompt);
            b.response = chat.response.unwrap_or(b.response);
            b.user_message = chat.user_message.unwrap_or(b.user_message);
            b.wiggle_room = chat.wiggle_room.unwrap_or(b.wiggle_room);
            b.max_window = chat.max_window.unwrap_or(b.max_window);
        }
        if let Some(analysis) = &self.analysis {
            let b = &mut budgets.analysis;
            b.metric = analysis.metric.unwrap_or(b.metric);
            b.context_window = analysis.context_window.unwrap_or(b.context_window);
            b.system_prompt = analysis.system_prompt.unwrap_or(b.system_prompt);
            b.response = analysis.response.unwrap_or(b.response);
            b.user_message = analysis.user_message.unwrap_or(b.user_message);
            b.reply = analysis.reply.unwrap_or(b.reply);
            b.wiggle_room = analysis.wiggle_room.unwrap_or(b.wiggle_room);
            b.max_window = analysis.max_window.unwrap_or(b.max_window);
        }

        budgets.validate()?;
        Ok(budgets)
    }

    #[must_use]
    pub fn lease(&self) -> Duration {
        let secs = self
            .lock
            .as_ref()
            .and_then(|lock| lock.lease_secs)
            .unwrap_or(DEFAULT_LEASE_SECS);
        Duration::from_secs(secs)
    }

    #[must_use]
    pub fn model(&self) -> &str {
        self.app
            .as_ref()
            .and_then(|app| app.model.as_deref())
            .unwrap_or(DEFAULT_MODEL)
    }

    #[must_use]
    pub fn distill_model(&self) -> &str {
        self.app
            .as_ref()
            .and_then(|app| app.distill_model.as_deref())
            .unwrap_or_else(|| self.model())
    }

    #[must_use]
    pub fn base_url(&self) -> Option<&str> {
        self.openai.as_ref().and_then(|o| o.base_url.as_deref())
    }

    /// Configured key with `${VAR}` references expanded, falling back to
    /// `OPENAI_API_KEY`.
    #[must_use]
    pub fn openai_api_key(&self) -> Option<String> {
        self.api_keys
            .as_ref()
            .and_then(|keys| keys.openai.as_deref())
            .map(expand_env_vars)
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }

    #[must_use]
    pub fn database_path(&self) -> Option<PathBuf> {
        self.app
            .as_ref()
            .and_then(|app| app.database.clone())
            .or_else(|| mnemo_home().map(|home| home.join("mnemo.db")))
    }
}

#[must_use]
pub fn mnemo_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mnemo"))
}

pub fn config_path() -> Option<PathBuf> {
    mnemo_home().map(|home| home.join("config.toml"))
}
