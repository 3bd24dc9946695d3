//! nanoclaw: routes chat messages to per-conversation agent containers.

pub mod channels;
pub mod config;
pub mod container;
pub mod error;
pub mod group_folder;
pub mod ipc;
pub mod orchestrator;
pub mod queue;
pub mod router;
pub mod store;
pub mod types;
pub mod warm_pool;
