//! [`Database`] over a single libSQL connection, file-backed or in memory.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::types::{ChatInfo, ContainerConfig, Exchange, NewMessage, RegisteredGroup};

/// Message store. One connection serves every caller; libSQL connections
/// are `Send + Sync`.
pub struct LibSqlBackend {
    // Owns the engine the connection was opened from.
    _db: LibSqlDatabase,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open or create the store at `path`, upgrading its schema.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::Open(format!("{}: {e}", parent.display())))?;
        }
        let backend = Self::open(path).await?;
        info!(path = %path.display(), "Message store opened");
        Ok(backend)
    }

    /// Throwaway in-memory store.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Self::open(Path::new(":memory:")).await
    }

    async fn open(target: &Path) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(target)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(e.to_string()))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("connect: {e}")))?;
        let backend = Self { _db: db, conn };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str =
    "id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message";

/// Map a libsql Row to a NewMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<NewMessage, libsql::Error> {
    Ok(NewMessage {
        id: row.get(0)?,
        chat_jid: row.get(1)?,
        sender: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        timestamp: row.get(5)?,
        is_from_me: row.get::<i64>(6)? != 0,
        is_bot_message: row.get::<i64>(7)? != 0,
    })
}

/// `LIKE` pattern matching content written with the bot prefix.
fn bot_prefix_pattern(bot_prefix: &str) -> String {
    let escaped = bot_prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{escaped}:%")
}

async fn collect_messages(
    mut rows: libsql::Rows,
    op: &str,
) -> Result<Vec<NewMessage>, DatabaseError> {
    let mut messages = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        match row_to_message(&row) {
            Ok(msg) => messages.push(msg),
            Err(e) => warn!(error = %e, "{op}: skipping unreadable row"),
        }
    }
    Ok(messages)
}

/// Pair each bot reply with the user message that precedes it.
fn pair_exchanges(messages: &[NewMessage], limit: usize) -> Vec<Exchange> {
    let mut exchanges = Vec::new();
    let mut last_user: Option<&str> = None;
    for msg in messages {
        if msg.is_bot_message {
            if let Some(user) = last_user.take() {
                exchanges.push(Exchange {
                    user_message: user.to_string(),
                    bot_message: msg.content.clone(),
                });
            }
        } else {
            last_user = Some(msg.content.as_str());
        }
    }
    let skip = exchanges.len().saturating_sub(limit);
    exchanges.split_off(skip)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Chats & messages ────────────────────────────────────────────

    async fn store_chat_metadata(&self, chat: &ChatInfo) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO chats (jid, name, channel, is_group, last_message_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (jid) DO UPDATE SET
                    name = COALESCE(excluded.name, chats.name),
                    channel = excluded.channel,
                    is_group = excluded.is_group,
                    last_message_time = MAX(chats.last_message_time, excluded.last_message_time)",
                params![
                    chat.jid.clone(),
                    match &chat.name {
                        Some(n) => libsql::Value::Text(n.clone()),
                        None => libsql::Value::Null,
                    },
                    chat.channel.clone(),
                    chat.is_group as i64,
                    chat.last_message_time.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_chat_metadata: {e}")))?;
        Ok(())
    }

    async fn store_message(&self, msg: &NewMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO messages ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    msg.id.clone(),
                    msg.chat_jid.clone(),
                    msg.sender.clone(),
                    msg.sender_name.clone(),
                    msg.content.clone(),
                    msg.timestamp.clone(),
                    msg.is_from_me as i64,
                    msg.is_bot_message as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_message: {e}")))?;

        debug!(id = %msg.id, chat_jid = %msg.chat_jid, "Message stored");
        Ok(())
    }

    async fn get_new_messages(
        &self,
        jids: &[String],
        since: &str,
        bot_prefix: &str,
    ) -> Result<(Vec<NewMessage>, String), DatabaseError> {
        if jids.is_empty() {
            return Ok((Vec::new(), since.to_string()));
        }

        let placeholders: Vec<String> = (0..jids.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE timestamp > ?1
               AND is_bot_message = 0
               AND content NOT LIKE ?2 ESCAPE '\\'
               AND chat_jid IN ({})
             ORDER BY timestamp ASC",
            placeholders.join(", ")
        );

        let mut values = vec![
            libsql::Value::Text(since.to_string()),
            libsql::Value::Text(bot_prefix_pattern(bot_prefix)),
        ];
        values.extend(jids.iter().map(|j| libsql::Value::Text(j.clone())));

        let rows = self
            .conn()
            .query(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("get_new_messages: {e}")))?;
        let messages = collect_messages(rows, "get_new_messages").await?;

        let newest = messages
            .iter()
            .map(|m| m.timestamp.as_str())
            .max()
            .unwrap_or(since)
            .to_string();
        Ok((messages, newest))
    }

    async fn get_messages_since(
        &self,
        chat_jid: &str,
        since: &str,
        bot_prefix: &str,
    ) -> Result<Vec<NewMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_jid = ?1
                       AND timestamp > ?2
                       AND is_bot_message = 0
                       AND content NOT LIKE ?3 ESCAPE '\\'
                     ORDER BY timestamp ASC"
                ),
                params![chat_jid, since, bot_prefix_pattern(bot_prefix)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_messages_since: {e}")))?;
        collect_messages(rows, "get_messages_since").await
    }

    async fn get_recent_exchanges(
        &self,
        chat_jid: &str,
        limit: usize,
    ) -> Result<Vec<Exchange>, DatabaseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        // Enough history to find `limit` pairs in a chatty group.
        let window = (limit * 20) as i64;
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM (
                        SELECT {MESSAGE_COLUMNS} FROM messages
                        WHERE chat_jid = ?1
                        ORDER BY timestamp DESC
                        LIMIT ?2
                     ) ORDER BY timestamp ASC"
                ),
                params![chat_jid, window],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_recent_exchanges: {e}")))?;
        let messages = collect_messages(rows, "get_recent_exchanges").await?;
        Ok(pair_exchanges(&messages, limit))
    }

    // ── Router state ────────────────────────────────────────────────

    async fn get_router_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM router_state WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_router_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_router_state: {e}"))),
        }
    }

    async fn set_router_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO router_state (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_router_state: {e}")))?;
        Ok(())
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn get_all_sessions(&self) -> Result<HashMap<String, String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT group_folder, session_id FROM sessions", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("get_all_sessions: {e}")))?;

        let mut sessions = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let folder: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let session: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            sessions.insert(folder, session);
        }
        Ok(sessions)
    }

    async fn set_session(&self, group_folder: &str, session_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
                 ON CONFLICT (group_folder) DO UPDATE SET session_id = excluded.session_id",
                params![group_folder, session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_session: {e}")))?;
        Ok(())
    }

    // ── Registered groups ───────────────────────────────────────────

    async fn get_all_registered_groups(
        &self,
    ) -> Result<HashMap<String, RegisteredGroup>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT jid, name, folder, channel, requires_trigger, added_at, container_config
                 FROM registered_groups",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_all_registered_groups: {e}")))?;

        let mut groups = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let parse = |e: libsql::Error| DatabaseError::Query(format!("row parse: {e}"));
            let jid: String = row.get(0).map_err(parse)?;
            let config_json: Option<String> = row.get(6).ok();
            let container_config = match config_json.as_deref() {
                Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                    warn!(jid = %jid, error = %e, "Unreadable container_config, using defaults");
                    ContainerConfig::default()
                }),
                None => ContainerConfig::default(),
            };
            let group = RegisteredGroup {
                jid: jid.clone(),
                name: row.get(1).map_err(parse)?,
                folder: row.get(2).map_err(parse)?,
                channel: row.get(3).map_err(parse)?,
                requires_trigger: row.get::<i64>(4).map_err(parse)? != 0,
                added_at: row.get(5).map_err(parse)?,
                container_config,
            };
            groups.insert(jid, group);
        }
        Ok(groups)
    }

    async fn set_registered_group(&self, group: &RegisteredGroup) -> Result<(), DatabaseError> {
        let config_json = serde_json::to_string(&group.container_config)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO registered_groups
                    (jid, name, folder, channel, requires_trigger, added_at, container_config)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (jid) DO UPDATE SET
                    name = excluded.name,
                    folder = excluded.folder,
                    channel = excluded.channel,
                    requires_trigger = excluded.requires_trigger,
                    container_config = excluded.container_config",
                params![
                    group.jid.clone(),
                    group.name.clone(),
                    group.folder.clone(),
                    group.channel.clone(),
                    group.requires_trigger as i64,
                    group.added_at.clone(),
                    config_json,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_registered_group: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn msg(id: &str, jid: &str, content: &str, ts: &str, bot: bool) -> NewMessage {
        NewMessage {
            id: id.to_string(),
            chat_jid: jid.to_string(),
            sender: if bot { "bot" } else { "user" }.to_string(),
            sender_name: if bot { "Andy" } else { "User" }.to_string(),
            content: content.to_string(),
            timestamp: ts.to_string(),
            is_from_me: bot,
            is_bot_message: bot,
        }
    }

    async fn seed(db: &LibSqlBackend) {
        for m in [
            msg("m1", "g1", "first", "2024-01-01T00:00:01.000Z", false),
            msg("m2", "g1", "second", "2024-01-01T00:00:02.000Z", false),
            msg("m3", "g1", "bot reply", "2024-01-01T00:00:03.000Z", true),
            msg("m4", "g1", "Andy: legacy reply", "2024-01-01T00:00:04.000Z", false),
            msg("m5", "g1", "third", "2024-01-01T00:00:05.000Z", false),
            msg("m6", "g2", "other chat", "2024-01-01T00:00:06.000Z", false),
        ] {
            db.store_message(&m).await.unwrap();
        }
    }

    #[tokio::test]
    async fn messages_since_excludes_bot_messages() {
        let db = test_db().await;
        seed(&db).await;

        let msgs = db
            .get_messages_since("g1", "2024-01-01T00:00:01.000Z", "Andy")
            .await
            .unwrap();
        let contents: Vec<_> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn messages_since_empty_cursor_returns_all_user_messages() {
        let db = test_db().await;
        seed(&db).await;
        let msgs = db.get_messages_since("g1", "", "Andy").await.unwrap();
        assert_eq!(msgs.len(), 3);
    }

    #[tokio::test]
    async fn new_messages_across_chats() {
        let db = test_db().await;
        seed(&db).await;

        let jids = vec!["g1".to_string(), "g2".to_string()];
        let (msgs, newest) = db
            .get_new_messages(&jids, "2024-01-01T00:00:02.000Z", "Andy")
            .await
            .unwrap();
        let ids: Vec<_> = msgs.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m5", "m6"]);
        assert_eq!(newest, "2024-01-01T00:00:06.000Z");
    }

    #[tokio::test]
    async fn new_messages_with_no_jids_keeps_cursor() {
        let db = test_db().await;
        seed(&db).await;
        let (msgs, newest) = db.get_new_messages(&[], "", "Andy").await.unwrap();
        assert!(msgs.is_empty());
        assert_eq!(newest, "");
    }

    #[tokio::test]
    async fn recent_exchanges_pair_in_order_and_respect_limit() {
        let db = test_db().await;
        for i in 1..=5 {
            db.store_message(&msg(&format!("u{i}"), "g3", &format!("q{i}"), &format!("2024-01-01T00:00:0{i}.000Z"), false))
                .await
                .unwrap();
            db.store_message(&msg(&format!("b{i}"), "g3", &format!("a{i}"), &format!("2024-01-01T00:00:0{i}.500Z"), true))
                .await
                .unwrap();
        }

        let exchanges = db.get_recent_exchanges("g3", 2).await.unwrap();
        assert_eq!(exchanges.len(), 2);
        assert_eq!(exchanges[0].user_message, "q4");
        assert_eq!(exchanges[0].bot_message, "a4");
        assert_eq!(exchanges[1].bot_message, "a5");

        assert!(db.get_recent_exchanges("other", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn router_state_roundtrip() {
        let db = test_db().await;
        assert_eq!(db.get_router_state("last_timestamp").await.unwrap(), None);
        db.set_router_state("last_timestamp", "t1").await.unwrap();
        db.set_router_state("last_timestamp", "t2").await.unwrap();
        assert_eq!(
            db.get_router_state("last_timestamp").await.unwrap().as_deref(),
            Some("t2")
        );
    }

    #[tokio::test]
    async fn sessions_and_groups_persist() {
        let db = test_db().await;
        db.set_session("family", "s1").await.unwrap();
        db.set_session("family", "s2").await.unwrap();
        assert_eq!(db.get_all_sessions().await.unwrap()["family"], "s2");

        let mut group = RegisteredGroup::new("Family", "family", "tg:1", "telegram");
        group.container_config.timeout = Some(60_000);
        db.set_registered_group(&group).await.unwrap();

        let groups = db.get_all_registered_groups().await.unwrap();
        assert_eq!(groups["tg:1"], group);
    }

    #[tokio::test]
    async fn chat_metadata_keeps_newest_time() {
        let db = test_db().await;
        let mut chat = ChatInfo {
            jid: "tg:1".to_string(),
            name: Some("Family".to_string()),
            channel: "telegram".to_string(),
            is_group: true,
            last_message_time: "2024-01-02T00:00:00.000Z".to_string(),
        };
        db.store_chat_metadata(&chat).await.unwrap();
        chat.last_message_time = "2024-01-01T00:00:00.000Z".to_string();
        chat.name = None;
        db.store_chat_metadata(&chat).await.unwrap();

        let mut rows = db
            .conn()
            .query("SELECT name, last_message_time FROM chats WHERE jid = 'tg:1'", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let name: String = row.get(0).unwrap();
        let time: String = row.get(1).unwrap();
        assert_eq!(name, "Family");
        assert_eq!(time, "2024-01-02T00:00:00.000Z");
    }
}
