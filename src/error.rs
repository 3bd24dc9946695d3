//! Error taxonomy. Each subsystem has its own enum; [`Error`] wraps them
//! for the orchestrator entry points.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Group error: {0}")]
    Group(#[from] GroupError),
}

/// Bad or unparsable environment settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is invalid: {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("No channel owns jid {jid}")]
    NoOwner { jid: String },
}

/// Failures starting or talking to an agent container.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Failed to spawn container {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Container {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Container {name} exited with code {code}: {stderr}")]
    Exited {
        name: String,
        code: i32,
        stderr: String,
    },

    #[error("Invalid container output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filesystem IPC errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IPC I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed envelope {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Group(#[from] GroupError),
}

impl IpcError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Group folder errors.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("Invalid group folder: {0:?}")]
    InvalidFolder(String),

    #[error("Path escapes base directory: {path}")]
    EscapesBase { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, Error>;
