//! `Database` trait: single async interface for all persistence.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::types::{ChatInfo, Exchange, NewMessage, RegisteredGroup};

/// Router state key for the global-seen cursor.
pub const LAST_TIMESTAMP_KEY: &str = "last_timestamp";
/// Router state key for the JSON map of per-chat agent-seen cursors.
pub const LAST_AGENT_TIMESTAMP_KEY: &str = "last_agent_timestamp";

/// Backend-agnostic database trait covering the message log and router state.
///
/// Bot messages (flagged, or content prefixed `<bot_prefix>:`) are never
/// returned by the two fetch queries.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Chats & messages ────────────────────────────────────────────

    /// Upsert chat metadata, keeping the newest `last_message_time`.
    async fn store_chat_metadata(&self, chat: &ChatInfo) -> Result<(), DatabaseError>;

    /// Insert or replace a message.
    async fn store_message(&self, msg: &NewMessage) -> Result<(), DatabaseError>;

    /// Messages newer than `since` across `jids`, oldest first, plus the
    /// newest timestamp seen (or `since` when nothing is new).
    async fn get_new_messages(
        &self,
        jids: &[String],
        since: &str,
        bot_prefix: &str,
    ) -> Result<(Vec<NewMessage>, String), DatabaseError>;

    /// Messages in one chat newer than `since`, oldest first.
    async fn get_messages_since(
        &self,
        chat_jid: &str,
        since: &str,
        bot_prefix: &str,
    ) -> Result<Vec<NewMessage>, DatabaseError>;

    /// The last `limit` user → bot exchanges in a chat, oldest first.
    async fn get_recent_exchanges(
        &self,
        chat_jid: &str,
        limit: usize,
    ) -> Result<Vec<Exchange>, DatabaseError>;

    // ── Router state ────────────────────────────────────────────────

    async fn get_router_state(&self, key: &str) -> Result<Option<String>, DatabaseError>;

    async fn set_router_state(&self, key: &str, value: &str) -> Result<(), DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Agent session id per group folder.
    async fn get_all_sessions(&self) -> Result<HashMap<String, String>, DatabaseError>;

    async fn set_session(&self, group_folder: &str, session_id: &str) -> Result<(), DatabaseError>;

    // ── Registered groups ───────────────────────────────────────────

    /// Every registered group keyed by jid.
    async fn get_all_registered_groups(
        &self,
    ) -> Result<HashMap<String, RegisteredGroup>, DatabaseError>;

    async fn set_registered_group(&self, group: &RegisteredGroup) -> Result<(), DatabaseError>;
}
