//! Channel trait and the capability interfaces a channel may declare.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ChannelError;
use crate::types::NewMessage;

/// Inbound messages produced by a connected channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = NewMessage> + Send>>;

/// A messaging surface that owns a set of jids.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `jid` belongs to this channel's namespace.
    fn owns_jid(&self, jid: &str) -> bool;

    fn is_connected(&self) -> bool;

    /// Connect and start producing inbound messages.
    async fn connect(&self) -> Result<MessageStream, ChannelError>;

    async fn send_message(&self, jid: &str, text: &str) -> Result<(), ChannelError>;

    /// Show or clear a typing indicator. Channels without one ignore it.
    async fn set_typing(&self, _jid: &str, _typing: bool) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// File delivery capability, if this channel has one.
    fn file_delivery(&self) -> Option<&dyn FileDelivery> {
        None
    }
}

/// Sends a host file to a chat.
#[async_trait]
pub trait FileDelivery: Send + Sync {
    async fn send_file(
        &self,
        jid: &str,
        path: &Path,
        filename: &str,
        mime_type: Option<&str>,
        caption: Option<&str>,
    ) -> Result<(), ChannelError>;
}
