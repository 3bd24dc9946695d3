//! Schema steps for the message store.
//!
//! The applied step is tracked in SQLite's `user_version` pragma. Each step
//! runs inside one transaction together with the version bump, so a crash
//! mid-step leaves the previous version in place.

use libsql::Connection;

use crate::error::DatabaseError;

/// `(version, label, sql)`; append only.
const STEPS: &[(i64, &str, &str)] = &[
    (
        1,
        "chats and messages",
        r#"
        CREATE TABLE IF NOT EXISTS chats (
            jid TEXT PRIMARY KEY,
            name TEXT,
            channel TEXT NOT NULL DEFAULT '',
            is_group INTEGER NOT NULL DEFAULT 0,
            last_message_time TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT NOT NULL,
            chat_jid TEXT NOT NULL,
            sender TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            is_from_me INTEGER NOT NULL DEFAULT 0,
            is_bot_message INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (id, chat_jid)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_jid, timestamp);
        CREATE TABLE IF NOT EXISTS router_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS sessions (
            group_folder TEXT PRIMARY KEY,
            session_id TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "registered groups",
        r#"
        CREATE TABLE IF NOT EXISTS registered_groups (
            jid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            folder TEXT NOT NULL UNIQUE,
            channel TEXT NOT NULL,
            requires_trigger INTEGER NOT NULL DEFAULT 1,
            added_at TEXT NOT NULL,
            container_config TEXT
        );
        "#,
    ),
];

/// Highest version a fresh database ends up at.
pub fn latest_version() -> i64 {
    STEPS.last().map(|(v, _, _)| *v).unwrap_or(0)
}

/// Bring the schema up to [`latest_version`]. Safe to call on every start.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let start = schema_version(conn).await?;
    let mut applied = 0usize;

    for (version, label, sql) in STEPS.iter().filter(|(v, _, _)| *v > start) {
        tracing::info!(version, step = label, "Upgrading schema");
        let batch = format!("BEGIN;\n{sql}\nPRAGMA user_version = {version};\nCOMMIT;");
        if let Err(e) = conn.execute_batch(&batch).await {
            // The transaction may still be open if the failure was mid-batch.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "schema step {version} ({label}) failed: {e}"
            )));
        }
        applied += 1;
    }

    if applied > 0 {
        tracing::debug!(from = start, to = latest_version(), "Schema upgraded");
    }
    Ok(())
}

async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read_err = |e: libsql::Error| DatabaseError::Migration(format!("reading user_version: {e}"));
    let mut rows = conn.query("PRAGMA user_version", ()).await.map_err(read_err)?;
    match rows.next().await.map_err(read_err)? {
        Some(row) => row.get::<i64>(0).map_err(read_err),
        None => Ok(0),
    }
}
