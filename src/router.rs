//! Prompt formatting and outbound text cleanup.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{Exchange, NewMessage};

/// Escape `&`, `<`, `>` and `"`. Attributes are always double-quoted, so `'`
/// passes through.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Format a batch of messages into the XML payload handed to the agent.
///
/// `recent` exchanges, when present, are prefixed as a `<recent_context>`
/// block so a cold-started container sees the tail of the conversation.
pub fn format_messages(messages: &[NewMessage], recent: &[Exchange]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|m| {
            format!(
                "<message sender=\"{}\" time=\"{}\">{}</message>",
                escape_xml(&m.sender_name),
                escape_xml(&m.timestamp),
                escape_xml(&m.content)
            )
        })
        .collect();
    let body = format!("<messages>\n{}\n</messages>", lines.join("\n"));

    if recent.is_empty() {
        return body;
    }

    let pairs: Vec<String> = recent
        .iter()
        .map(|e| {
            format!(
                "  <exchange>\n    <user>{}</user>\n    <assistant>{}</assistant>\n  </exchange>",
                escape_xml(&e.user_message),
                escape_xml(&e.bot_message)
            )
        })
        .collect();
    format!("<recent_context>\n{}\n</recent_context>\n{body}", pairs.join("\n"))
}

fn internal_tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)<internal>.*?</internal>").ok())
        .as_ref()
}

/// Remove `<internal>…</internal>` reasoning blocks and trim.
pub fn strip_internal_tags(text: &str) -> String {
    match internal_tag_pattern() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Text safe to show the user, or `None` when nothing is left.
pub fn format_outbound(raw: &str) -> Option<String> {
    let text = strip_internal_tags(raw);
    if text.is_empty() { None } else { Some(text) }
}

/// Whether any message in `messages` wakes the agent.
pub fn has_trigger(messages: &[NewMessage], trigger: &Regex) -> bool {
    messages.iter().any(|m| trigger.is_match(m.content.trim()))
}
