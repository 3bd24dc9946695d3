//! Persistence layer: libSQL-backed message log and router state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, LAST_AGENT_TIMESTAMP_KEY, LAST_TIMESTAMP_KEY};
