//! Shared domain types: registered groups, stored messages, exchanges.

use serde::{Deserialize, Serialize};

/// Per-group container overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Hard timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Model override passed to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A chat registered for agent service.
///
/// Created by an external registration flow and looked up by jid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredGroup {
    /// Human-readable name.
    pub name: String,
    /// Filesystem-safe folder id under `groups/`.
    pub folder: String,
    /// Channel-qualified chat id.
    pub jid: String,
    /// Name of the channel that owns `jid`.
    pub channel: String,
    /// Whether messages must start with `@<assistant>` to wake the agent.
    pub requires_trigger: bool,
    /// ISO-8601 registration time.
    pub added_at: String,
    #[serde(default)]
    pub container_config: ContainerConfig,
}

impl RegisteredGroup {
    /// Build a group with default container settings.
    pub fn new(
        name: impl Into<String>,
        folder: impl Into<String>,
        jid: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            folder: folder.into(),
            jid: jid.into(),
            channel: channel.into(),
            requires_trigger: true,
            added_at: chrono::Utc::now().to_rfc3339(),
            container_config: ContainerConfig::default(),
        }
    }

    pub fn with_requires_trigger(mut self, requires_trigger: bool) -> Self {
        self.requires_trigger = requires_trigger;
        self
    }

    /// Whether this is the privileged main group.
    pub fn is_main(&self) -> bool {
        crate::config::Config::is_main_folder(&self.folder)
    }
}

/// A chat message as stored and delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    /// ISO-8601; compared lexically.
    pub timestamp: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_bot_message: bool,
}

impl NewMessage {
    /// Inbound user message stamped with the current time.
    pub fn inbound(
        chat_jid: impl Into<String>,
        sender: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_jid: chat_jid.into(),
            sender: sender.into(),
            sender_name: sender_name.into(),
            content: content.into(),
            timestamp: now_timestamp(),
            is_from_me: false,
            is_bot_message: false,
        }
    }

    /// Agent reply recorded for later context.
    pub fn bot_reply(chat_jid: impl Into<String>, assistant_name: &str, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_jid: chat_jid.into(),
            sender: assistant_name.to_string(),
            sender_name: assistant_name.to_string(),
            content: text.into(),
            timestamp: now_timestamp(),
            is_from_me: true,
            is_bot_message: true,
        }
    }
}

/// Chat-level metadata observed on inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo {
    pub jid: String,
    pub name: Option<String>,
    pub channel: String,
    pub is_group: bool,
    pub last_message_time: String,
}

/// One prior user/assistant exchange used as recent context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user_message: String,
    pub bot_message: String,
}

/// Current time as a millisecond-precision RFC 3339 string.
///
/// Fixed width so lexical comparison matches chronological order.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
