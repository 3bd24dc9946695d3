//! Channel abstraction for message I/O.

pub mod channel;
pub mod cli;
pub mod manager;

pub use channel::*;
pub use cli::{CLI_JID, CliChannel};
pub use manager::ChannelRegistry;
