//! Poll tick and delivery decisions.
//!
//! Each tick advances the global cursor first, then per chat tries, in
//! order: pipe into the active container, claim a standby, wait for a
//! booting standby, or request a cold start.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::container::ContainerOutput;
use crate::error;
use crate::orchestrator::Orchestrator;
use crate::router::{format_messages, format_outbound, has_trigger};
use crate::types::{NewMessage, RegisteredGroup};

impl Orchestrator {
    /// One pass of the delivery loop.
    pub async fn tick(self: &Arc<Self>) -> error::Result<()> {
        let (jids, since) = {
            let state = self.state();
            let jids: Vec<String> = state.registered_groups.keys().cloned().collect();
            (jids, state.last_timestamp.clone())
        };
        if jids.is_empty() {
            return Ok(());
        }

        let (messages, newest) = self
            .db()
            .get_new_messages(&jids, &since, &self.config.assistant_name)
            .await?;
        if messages.is_empty() {
            return Ok(());
        }
        info!(count = messages.len(), "New messages");

        // Advance before dispatch so a crash never replays this batch as new.
        self.state().last_timestamp = newest;
        self.save_state().await?;

        let mut by_chat: HashMap<String, Vec<NewMessage>> = HashMap::new();
        for msg in messages {
            by_chat.entry(msg.chat_jid.clone()).or_default().push(msg);
        }

        for (chat_jid, batch) in by_chat {
            if let Err(e) = self.deliver(&chat_jid, &batch).await {
                error!(chat_jid = %chat_jid, error = %e, "Delivery failed");
            }
        }
        Ok(())
    }

    async fn deliver(self: &Arc<Self>, chat_jid: &str, batch: &[NewMessage]) -> error::Result<()> {
        let Some(group) = self.group(chat_jid) else {
            return Ok(());
        };

        if needs_trigger(&group) && !has_trigger(batch, &self.trigger) {
            debug!(chat_jid = %chat_jid, "No trigger in batch, kept as context");
            return Ok(());
        }

        let previous_cursor = self.agent_cursor(chat_jid);
        let pending = self.agent_backlog(chat_jid, &previous_cursor).await?;
        // Empty when a cold turn already took this batch.
        let Some(last_timestamp) = pending.last().map(|m| m.timestamp.clone()) else {
            debug!(chat_jid = %chat_jid, "Batch already delivered, nothing to send");
            return Ok(());
        };
        let text = format_messages(&pending, &[]);

        if self.queue.send_message(chat_jid, &text) {
            debug!(chat_jid = %chat_jid, count = pending.len(), "Piped messages to active container");
            self.set_agent_cursor(chat_jid, &last_timestamp).await;
            self.set_typing(chat_jid, true).await;
            return Ok(());
        }

        if let Some(pool) = &self.warm_pool {
            let (tx, rx) = mpsc::unbounded_channel();
            if pool.claim(chat_jid, &text, tx) {
                info!(chat_jid = %chat_jid, count = pending.len(), "Delivered to claimed standby");
                self.set_agent_cursor(chat_jid, &last_timestamp).await;
                let this = Arc::clone(self);
                let jid = chat_jid.to_string();
                tokio::spawn(async move {
                    this.consume_claimed_output(jid, group, previous_cursor, rx).await;
                });
                self.set_typing(chat_jid, true).await;
                return Ok(());
            }
            if pool.is_booting(chat_jid) {
                debug!(chat_jid = %chat_jid, "Standby booting, deferring to next tick");
                return Ok(());
            }
        }

        self.queue.enqueue_message_check(chat_jid);
        Ok(())
    }

    /// Forward a claimed container's outputs to the chat.
    ///
    /// An error before anything reached the user rolls the agent cursor back
    /// and requests a retry; once output went out the cursor stays put.
    async fn consume_claimed_output(
        self: Arc<Self>,
        chat_jid: String,
        group: RegisteredGroup,
        previous_cursor: String,
        mut outputs: mpsc::UnboundedReceiver<ContainerOutput>,
    ) {
        let mut output_sent = false;
        while let Some(output) = outputs.recv().await {
            output_sent |= self.handle_output(&chat_jid, &group, &output).await;
            if output.is_error() {
                if output_sent {
                    warn!(chat_jid = %chat_jid, "Agent error after output was sent, cursor held");
                } else {
                    warn!(chat_jid = %chat_jid, cursor = %previous_cursor, "Agent error, rolling back cursor");
                    self.set_agent_cursor(&chat_jid, &previous_cursor).await;
                    self.queue.enqueue_message_check(&chat_jid);
                }
            }
        }
        debug!(chat_jid = %chat_jid, "Claimed container output stream ended");
    }

    /// Apply one streamed output. Returns whether text reached the user.
    pub(crate) async fn handle_output(
        &self,
        chat_jid: &str,
        group: &RegisteredGroup,
        output: &ContainerOutput,
    ) -> bool {
        if let Some(session) = &output.new_session_id {
            self.record_session(&group.folder, session).await;
        }

        let mut delivered = false;
        if let Some(raw) = output.result_text() {
            if let Some(text) = format_outbound(&raw) {
                match self.deps.channels.send(chat_jid, &text).await {
                    Ok(()) => {
                        delivered = true;
                        self.store_reply(chat_jid, &text).await;
                    }
                    Err(e) => warn!(chat_jid = %chat_jid, error = %e, "Failed to send agent reply"),
                }
            }
            self.queue
                .reset_idle_timer(chat_jid, self.config.idle_timeout);
        }

        if output.is_error() {
            if let Some(e) = &output.error {
                warn!(chat_jid = %chat_jid, error = %e, "Agent reported error");
            }
        } else {
            self.queue.notify_idle(chat_jid);
        }
        self.set_typing(chat_jid, false).await;
        delivered
    }

    async fn store_reply(&self, chat_jid: &str, text: &str) {
        let reply = NewMessage::bot_reply(chat_jid, &self.config.assistant_name, text);
        if let Err(e) = self.db().store_message(&reply).await {
            warn!(chat_jid = %chat_jid, error = %e, "Failed to store agent reply");
        }
    }

    pub(crate) async fn set_typing(&self, chat_jid: &str, typing: bool) {
        if let Some(channel) = self.deps.channels.find(chat_jid) {
            if let Err(e) = channel.set_typing(chat_jid, typing).await {
                debug!(chat_jid = %chat_jid, error = %e, "Typing indicator failed");
            }
        }
    }

    /// Re-enqueue chats whose stored messages are past their agent cursor.
    pub async fn recover_pending_messages(&self) -> usize {
        let groups: Vec<RegisteredGroup> = self.state().registered_groups.values().cloned().collect();
        let mut recovered = 0;
        for group in groups {
            let since = self.agent_cursor(&group.jid);
            match self.agent_backlog(&group.jid, &since).await {
                Ok(pending) if !pending.is_empty() => {
                    info!(
                        chat_jid = %group.jid,
                        group = %group.name,
                        pending = pending.len(),
                        "Recovery: found unprocessed messages"
                    );
                    self.queue.enqueue_message_check(&group.jid);
                    recovered += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(chat_jid = %group.jid, error = %e, "Recovery check failed"),
            }
        }
        recovered
    }

    /// Start the poll loop. Returns `None` if it is already running.
    pub fn spawn_message_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.loop_running.swap(true, Ordering::SeqCst) {
            warn!("Message loop already running, refusing second start");
            return None;
        }
        info!(trigger = %self.trigger.as_str(), "Message loop started");

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            while !this.queue.is_shutting_down() {
                if let Err(e) = this.tick().await {
                    error!(error = %e, "Error in message loop");
                }
                tokio::time::sleep(this.config.poll_interval).await;
            }
            this.loop_running.store(false, Ordering::SeqCst);
            info!("Message loop stopped");
        }))
    }
}

/// The main group always wakes the agent; others only on a trigger when
/// they require one.
pub(crate) fn needs_trigger(group: &RegisteredGroup) -> bool {
    !group.is_main() && group.requires_trigger
}
