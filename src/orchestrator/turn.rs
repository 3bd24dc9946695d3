//! Cold-start turns.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::container::{ContainerEvent, ContainerInput, read_secrets};
use crate::orchestrator::Orchestrator;
use crate::orchestrator::delivery::needs_trigger;
use crate::router::{format_messages, has_trigger};
use crate::types::RegisteredGroup;

/// What reached the user during one container run.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RunOutcome {
    pub(crate) output_sent: bool,
    pub(crate) failed: bool,
}

impl Orchestrator {
    /// Run one cold-start turn for `chat_jid`. Returns `false` to ask the
    /// queue for a retry.
    pub(crate) async fn process_group_messages(self: &Arc<Self>, chat_jid: &str) -> bool {
        let Some(group) = self.group(chat_jid) else {
            return true;
        };

        let previous_cursor = self.agent_cursor(chat_jid);
        let messages = match self.agent_backlog(chat_jid, &previous_cursor).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(chat_jid = %chat_jid, error = %e, "Failed to load pending messages");
                return false;
            }
        };
        if messages.is_empty() {
            return true;
        }
        if needs_trigger(&group) && !has_trigger(&messages, &self.trigger) {
            return true;
        }

        let recent = if self.config.recent_context_pairs > 0 {
            self.db()
                .get_recent_exchanges(chat_jid, self.config.recent_context_pairs)
                .await
                .unwrap_or_else(|e| {
                    warn!(chat_jid = %chat_jid, error = %e, "Failed to load recent context");
                    Vec::new()
                })
        } else {
            Vec::new()
        };
        let prompt = format_messages(&messages, &recent);

        let Some(last_timestamp) = messages.last().map(|m| m.timestamp.clone()) else {
            return true;
        };
        self.set_agent_cursor(chat_jid, &last_timestamp).await;

        info!(
            chat_jid = %chat_jid,
            group = %group.name,
            message_count = messages.len(),
            "Processing messages"
        );
        self.set_typing(chat_jid, true).await;
        let outcome = self.run_agent(&group, chat_jid, prompt).await;
        self.queue.clear_idle_timer(chat_jid);
        self.set_typing(chat_jid, false).await;

        if !outcome.failed {
            return true;
        }
        if outcome.output_sent {
            warn!(chat_jid = %chat_jid, "Agent error after output was sent, cursor held");
            return true;
        }
        warn!(chat_jid = %chat_jid, cursor = %previous_cursor, "Agent error, rolling back cursor for retry");
        self.set_agent_cursor(chat_jid, &previous_cursor).await;
        false
    }

    /// Start a container for `group` and stream its outputs to the chat.
    pub(crate) async fn run_agent(
        self: &Arc<Self>,
        group: &RegisteredGroup,
        chat_jid: &str,
        prompt: String,
    ) -> RunOutcome {
        let input = ContainerInput {
            prompt,
            session_id: self.session_for(&group.folder),
            group_folder: group.folder.clone(),
            chat_jid: chat_jid.to_string(),
            is_main: group.is_main(),
            is_scheduled_task: false,
            assistant_name: Some(self.config.assistant_name.clone()),
            model: group.container_config.model.clone(),
            secrets: Arc::new(read_secrets()),
        };

        let (tx, mut events) = mpsc::unbounded_channel();
        let consume = async {
            let mut outcome = RunOutcome::default();
            while let Some(event) = events.recv().await {
                match event {
                    ContainerEvent::Spawned(handle) => {
                        debug!(chat_jid = %chat_jid, container = %handle.container_name(), "Container spawned");
                        self.queue.register_process(chat_jid, handle, &group.folder);
                    }
                    ContainerEvent::Output(output) => {
                        outcome.output_sent |= self.handle_output(chat_jid, group, &output).await;
                        outcome.failed |= output.is_error();
                    }
                }
            }
            outcome
        };
        let (result, mut outcome) = tokio::join!(self.deps.runner.run(group, input, tx), consume);

        match result {
            Ok(output) => {
                if let Some(session) = &output.new_session_id {
                    self.record_session(&group.folder, session).await;
                }
                if output.is_error() {
                    warn!(chat_jid = %chat_jid, error = ?output.error, "Container finished with error");
                    outcome.failed = true;
                }
            }
            Err(e) => {
                error!(chat_jid = %chat_jid, group = %group.name, error = %e, "Container agent error");
                outcome.failed = true;
            }
        }
        outcome
    }
}
