//! CLI channel: stdin/stdout REPL for local testing.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Channel, FileDelivery, MessageStream};
use crate::error::ChannelError;
use crate::types::NewMessage;

/// Jid of the single local chat.
pub const CLI_JID: &str = "cli:local";

/// Terminal chat: each stdin line becomes an inbound message in [`CLI_JID`],
/// replies and files are printed to stdout.
pub struct CliChannel {
    connected: AtomicBool,
}

impl CliChannel {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
        }
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    fn owns_jid(&self, jid: &str) -> bool {
        jid.starts_with("cli:")
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.connected.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            eprint!("> ");
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "stdin read failed, CLI input stopped");
                        break;
                    }
                };
                let text = line.trim();
                if text.is_empty() {
                    eprint!("> ");
                    continue;
                }
                let msg = NewMessage::inbound(CLI_JID, "local-user", "You", text.to_string());
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });

        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })))
    }

    async fn send_message(&self, _jid: &str, text: &str) -> Result<(), ChannelError> {
        println!("\n{text}\n");
        eprint!("> ");
        Ok(())
    }

    async fn set_typing(&self, _jid: &str, typing: bool) -> Result<(), ChannelError> {
        if typing {
            eprintln!("⏳ thinking...");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn file_delivery(&self) -> Option<&dyn FileDelivery> {
        Some(self)
    }
}

#[async_trait]
impl FileDelivery for CliChannel {
    async fn send_file(
        &self,
        _jid: &str,
        path: &Path,
        filename: &str,
        _mime_type: Option<&str>,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        match caption {
            Some(caption) => println!("\n📎 {filename} ({}): {caption}\n", path.display()),
            None => println!("\n📎 {filename} ({})\n", path.display()),
        }
        eprint!("> ");
        Ok(())
    }
}
