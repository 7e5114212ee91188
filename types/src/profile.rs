use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A scored observation about the user: `(name, strength 0-100, rationale)`.
///
/// Serialized as a three-element array, which is the shape the distillation
/// model is asked to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, u8, String)", into = "(String, u8, String)")]
pub struct Assessment {
    pub name: String,
    pub strength: u8,
    pub rationale: String,
}

impl From<(String, u8, String)> for Assessment {
    fn from((name, strength, rationale): (String, u8, String)) -> Self {
        Self {
            name,
            strength,
            rationale,
        }
    }
}

impl From<Assessment> for (String, u8, String) {
    fn from(value: Assessment) -> Self {
        (value.name, value.strength, value.rationale)
    }
}

/// Distilled long-term memory about the user.
///
/// Replaced wholesale by every successful distillation; never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub basic_info: BTreeMap<String, String>,
    pub traits: Vec<Assessment>,
    pub skills: Vec<Assessment>,
    pub factual_history: Vec<String>,
    pub summary: String,
}

impl UserProfile {
    pub const MAX_LIST_ENTRIES: usize = 15;
    pub const MAX_STRENGTH: u8 = 100;

    /// The profile a conversation starts with.
    #[must_use]
    pub fn blank() -> Self {
        let basic_info = ["name", "current_location", "occupation", "sex"]
            .into_iter()
            .map(|key| (key.to_string(), String::new()))
            .collect();
        Self {
            basic_info,
            traits: Vec::new(),
            skills: Vec::new(),
            factual_history: Vec::new(),
            summary: String::new(),
        }
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::blank()
    }
}
