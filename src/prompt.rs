//! Flattening of chat messages into a single horde prompt.
use crate::models::ChatMessage;
use tracing::warn;

/// Roles that make it into the prompt, with the label each one is rendered with.
const ROLE_LABELS: &[(&str, &str)] = &[
    ("system", "System"),
    ("user", "User"),
    ("assistant", "Assistant"),
];

fn role_label(role: &str) -> Option<&'static str> {
    ROLE_LABELS
        .iter()
        .find(|(name, _)| *name == role)
        .map(|(_, label)| *label)
}

/// Renders each known-role message as `"<Role>: <content>"` and joins them with single spaces.
/// Messages with any other role are dropped.
///
/// If the result is longer than `max_length` characters, only the trailing `max_length`
/// characters are kept; the oldest context goes first.
pub fn build_prompt(messages: &[ChatMessage], max_length: usize) -> String {
    let prompt = messages
        .iter()
        .filter_map(|message| {
            let label = role_label(message.role.as_deref()?)?;
            let content = message
                .content
                .as_ref()
                .map(|content| content.to_text())
                .unwrap_or_default();
            Some(format!("{label}: {content}"))
        })
        .collect::<Vec<_>>()
        .join(" ");

    truncate_front(prompt, max_length)
}

fn truncate_front(prompt: String, max_length: usize) -> String {
    let length = prompt.chars().count();
    if length <= max_length {
        return prompt;
    }

    warn!(
        length,
        max_length, "Prompt exceeds maximum length, truncating from the front"
    );
    let skip = length - max_length;
    match prompt.char_indices().nth(skip) {
        Some((offset, _)) => prompt[offset..].to_owned(),
        None => String::new(),
    }
}
