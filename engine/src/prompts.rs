//! Prompt assembly for chat turns and distillation calls.

use std::fmt::Write;

use mnemo_providers::ChatMessage;
use mnemo_types::{Role, StoredMessage, UserProfile};

const CHAT_SYSTEM_TEMPLATE: &str = include_str!("../assets/chat_system.md");
const DISTILLATION_TEMPLATE: &str = include_str!("../assets/distillation.md");

/// Sent after a reply that failed profile validation.
pub const RETRY_INSTRUCTION: &str = "This response is not a valid profile, incorrect syntax. \
Please try one more time, responding with only the JSON object.";

const DISTILLATION_REQUEST: &str = "What can you infer about the user from the following chat \
history? Respond ONLY with the updated profile JSON object.\n\n";

fn chat_message(message: &StoredMessage) -> ChatMessage {
    match message.role {
        Role::User => ChatMessage::user(message.content.clone()),
        Role::Assistant => ChatMessage::assistant(message.content.clone()),
    }
}

/// Messages for a chat completion.
///
/// `window` is newest first, as loaded; the prompt replays it oldest first
/// after the system message and ends with the new user text.
pub fn chat_messages(
    profile: &UserProfile,
    window: &[StoredMessage],
    text: &str,
) -> Result<Vec<ChatMessage>, serde_json::Error> {
    let profile_json = serde_json::to_string(profile)?;
    let system = CHAT_SYSTEM_TEMPLATE.replace("{profile}", &profile_json);

    let mut messages = Vec::with_capacity(window.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(window.iter().rev().map(chat_message));
    messages.push(ChatMessage::user(text));
    Ok(messages)
}

/// Messages for a distillation call over `batch` (oldest first).
pub fn distillation_messages(
    profile: &UserProfile,
    batch: &[StoredMessage],
) -> Result<Vec<ChatMessage>, serde_json::Error> {
    let profile_json = serde_json::to_string_pretty(profile)?;
    let system = DISTILLATION_TEMPLATE
        .replace("{max_entries}", &UserProfile::MAX_LIST_ENTRIES.to_string())
        .replace("{profile}", &profile_json);

    let mut transcript = String::from(DISTILLATION_REQUEST);
    for message in batch {
        let _ = write!(
            transcript,
            "{}: {}\n\n",
            message.role.as_str(),
            message.content
        );
    }

    Ok(vec![ChatMessage::system(system), ChatMessage::user(transcript)])
}
