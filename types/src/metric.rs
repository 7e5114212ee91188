use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named token-counting scheme.
///
/// The chat and analysis windows may each use a different metric, so every
/// stored message carries a length under each metric in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenMetric {
    #[serde(rename = "cl100k_base")]
    Cl100kBase,
    #[serde(rename = "o200k_base")]
    O200kBase,
    #[serde(rename = "p50k_base")]
    P50kBase,
    #[serde(rename = "r50k_base")]
    R50kBase,
    /// Whitespace-separated words. Cheap, encoder-free.
    #[serde(rename = "words")]
    Words,
}

impl TokenMetric {
    pub const ALL: [TokenMetric; 5] = [
        TokenMetric::Cl100kBase,
        TokenMetric::O200kBase,
        TokenMetric::P50kBase,
        TokenMetric::R50kBase,
        TokenMetric::Words,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cl100kBase => "cl100k_base",
            Self::O200kBase => "o200k_base",
            Self::P50kBase => "p50k_base",
            Self::R50kBase => "r50k_base",
            Self::Words => "words",
        }
    }
}

impl fmt::Display for TokenMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown token metric: {0}")]
pub struct UnknownMetricError(pub String);

impl FromStr for TokenMetric {
    type Err = UnknownMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownMetricError(s.to_string()))
    }
}

/// Per-metric token counts for one piece of text.
pub type TokenLengths = BTreeMap<TokenMetric, u32>;

/// Sum of `metric` lengths across items; missing entries count as zero.
pub fn total_length<'a, I>(lengths: I, metric: TokenMetric) -> u32
where
    I: IntoIterator<Item = &'a TokenLengths>,
{
    lengths
        .into_iter()
        .map(|l| l.get(&metric).copied().unwrap_or(0))
        .fold(0u32, u32::saturating_add)
}
