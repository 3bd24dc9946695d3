//! Registry of connected channels, looked up by jid.

use std::sync::Arc;

use crate::channels::Channel;
use crate::error::ChannelError;

/// Holds every channel and resolves which one owns a jid.
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: Arc<dyn Channel>) {
        tracing::debug!(channel = channel.name(), "Channel registered");
        self.channels.push(channel);
    }

    pub fn all(&self) -> &[Arc<dyn Channel>] {
        &self.channels
    }

    /// The channel owning `jid`, connected or not.
    pub fn find(&self, jid: &str) -> Option<Arc<dyn Channel>> {
        self.channels.iter().find(|c| c.owns_jid(jid)).cloned()
    }

    /// Send `text` through the connected owner of `jid`.
    pub async fn send(&self, jid: &str, text: &str) -> Result<(), ChannelError> {
        let channel = self
            .channels
            .iter()
            .find(|c| c.owns_jid(jid) && c.is_connected())
            .ok_or_else(|| ChannelError::NoOwner {
                jid: jid.to_string(),
            })?;
        channel.send_message(jid, text).await
    }

    /// Disconnect every channel, logging failures.
    pub async fn disconnect_all(&self) {
        for channel in &self.channels {
            if let Err(e) = channel.disconnect().await {
                tracing::warn!(channel = channel.name(), error = %e, "Channel disconnect failed");
            }
        }
    }
}
