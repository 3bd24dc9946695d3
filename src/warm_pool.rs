//! Standby container pool.
//!
//! One idle container per registered chat, started ahead of the first
//! message so a reply does not pay for a cold start. Per chat:
//!
//! ```text
//! EMPTY ──prewarm──▶ BOOTING ──Spawned──▶ STANDBY ──claim──▶ CLAIMED (queue owns it)
//!                       │                    │
//!                       └──────exit──────────┴──▶ EMPTY, respawn after settle delay
//! ```
//!
//! Standby slots are reserved through [`GroupQueue::try_reserve_standby`] so
//! they share the queue's ceiling. Claim and exit handling both decide under
//! the entries lock, which makes `claimed` flip at most once and keeps an
//! exiting standby from being handed out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::{
    ContainerEvent, ContainerInput, ContainerOutput, ContainerRunner, ProcessHandle, STANDBY_PROMPT,
    read_secrets,
};
use crate::queue::GroupQueue;
use crate::types::RegisteredGroup;

/// Receives every output a claimed container streams.
pub type OutputSink = mpsc::UnboundedSender<ContainerOutput>;

#[derive(Debug, Clone)]
pub struct WarmPoolConfig {
    /// Settle delay between a standby exiting and its replacement starting.
    pub respawn_delay: Duration,
    pub assistant_name: String,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            respawn_delay: Duration::from_secs(2),
            assistant_name: "Andy".to_string(),
        }
    }
}

impl From<&Config> for WarmPoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            respawn_delay: config.warm_respawn_delay,
            assistant_name: config.assistant_name.clone(),
        }
    }
}

/// Result of a [`WarmPool::prewarm`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrewarmOutcome {
    Started,
    AlreadyPresent,
    AtCapacity,
    ShuttingDown,
}

struct WarmEntry {
    group: RegisteredGroup,
    claimed: AtomicBool,
    sink: Mutex<Option<OutputSink>>,
    process: Mutex<Option<ProcessHandle>>,
}

impl WarmEntry {
    fn process(&self) -> Option<ProcessHandle> {
        self.process.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn sink(&self) -> Option<OutputSink> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct WarmPool {
    queue: Arc<GroupQueue>,
    runner: Arc<dyn ContainerRunner>,
    config: WarmPoolConfig,
    entries: Mutex<HashMap<String, Arc<WarmEntry>>>,
    /// Latest agent session per group folder.
    sessions: Mutex<HashMap<String, String>>,
}

impl WarmPool {
    pub fn new(
        queue: Arc<GroupQueue>,
        runner: Arc<dyn ContainerRunner>,
        config: WarmPoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            runner,
            config,
            entries: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<WarmEntry>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Standby entries, booting or ready.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a standby container for `chat_jid` unless one exists or the
    /// host is at its ceiling.
    pub fn prewarm(
        self: &Arc<Self>,
        chat_jid: &str,
        group: &RegisteredGroup,
        session_id: Option<&str>,
    ) -> PrewarmOutcome {
        if self.queue.is_shutting_down() {
            return PrewarmOutcome::ShuttingDown;
        }

        let entry = {
            let mut entries = self.entries();
            if entries.contains_key(chat_jid) {
                debug!(chat_jid = %chat_jid, "Standby already present, skipping prewarm");
                return PrewarmOutcome::AlreadyPresent;
            }
            if !self.queue.try_reserve_standby() {
                debug!(
                    chat_jid = %chat_jid,
                    active = self.queue.get_active_count(),
                    standby = self.queue.standby_count(),
                    "At concurrency limit, prewarm deferred"
                );
                return PrewarmOutcome::AtCapacity;
            }
            let entry = Arc::new(WarmEntry {
                group: group.clone(),
                claimed: AtomicBool::new(false),
                sink: Mutex::new(None),
                process: Mutex::new(None),
            });
            entries.insert(chat_jid.to_string(), Arc::clone(&entry));
            entry
        };

        let session_id = session_id
            .map(str::to_string)
            .or_else(|| self.session_for(&group.folder));
        let input = ContainerInput {
            prompt: STANDBY_PROMPT.to_string(),
            session_id,
            group_folder: group.folder.clone(),
            chat_jid: chat_jid.to_string(),
            is_main: group.is_main(),
            is_scheduled_task: true,
            assistant_name: Some(self.config.assistant_name.clone()),
            model: group.container_config.model.clone(),
            secrets: Arc::new(read_secrets()),
        };

        info!(chat_jid = %chat_jid, group = %group.name, "Prewarming standby container");
        let this = Arc::clone(self);
        let jid = chat_jid.to_string();
        tokio::spawn(async move { this.run_standby(jid, entry, input).await });
        PrewarmOutcome::Started
    }

    /// True between `prewarm` and the container reporting its process.
    pub fn is_booting(&self, chat_jid: &str) -> bool {
        self.entries()
            .get(chat_jid)
            .is_some_and(|entry| entry.process().is_none())
    }

    /// Hand the chat's standby container to the queue and deliver `text`.
    ///
    /// Returns `false` when there is no ready standby; the caller then
    /// falls back to a cold start. At most one claim per standby succeeds.
    pub fn claim(&self, chat_jid: &str, text: &str, sink: OutputSink) -> bool {
        let (folder, process) = {
            let mut entries = self.entries();
            let Some(entry) = entries.get(chat_jid).cloned() else {
                return false;
            };
            let Some(process) = entry.process() else {
                debug!(chat_jid = %chat_jid, "Standby still booting, cannot claim");
                return false;
            };
            if process.has_exited() || entry.claimed.load(Ordering::SeqCst) {
                return false;
            }
            if !self
                .queue
                .adopt_standby(chat_jid, process.clone(), &entry.group.folder)
            {
                debug!(chat_jid = %chat_jid, "Lane busy, standby left in place");
                return false;
            }
            *entry.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
            entry.claimed.store(true, Ordering::SeqCst);
            entries.remove(chat_jid);
            info!(chat_jid = %chat_jid, container = %process.container_name(), "Standby claimed");
            (entry.group.folder.clone(), process)
        };

        if !self.queue.send_message(chat_jid, text) {
            // It never saw the batch; stop it so its exit frees the lane.
            warn!(chat_jid = %chat_jid, group_folder = %folder, "Claimed standby did not accept input, stopping it");
            process.kill();
            return false;
        }
        true
    }

    /// Record the latest session so the next standby resumes it.
    pub fn update_session(&self, group_folder: &str, session_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(group_folder.to_string(), session_id.to_string());
    }

    fn session_for(&self, group_folder: &str) -> Option<String> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(group_folder)
            .cloned()
    }

    async fn run_standby(self: Arc<Self>, chat_jid: String, entry: Arc<WarmEntry>, input: ContainerInput) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let folder = entry.group.folder.clone();

        let pump = async {
            while let Some(event) = rx.recv().await {
                match event {
                    ContainerEvent::Spawned(handle) => {
                        info!(chat_jid = %chat_jid, container = %handle.container_name(), "Standby ready");
                        *entry.process.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                    }
                    ContainerEvent::Output(output) => {
                        if let Some(session) = &output.new_session_id {
                            self.update_session(&folder, session);
                        }
                        // Standby chatter is dropped until a claim installs a sink.
                        if let Some(sink) = entry.sink() {
                            let _ = sink.send(output);
                        }
                    }
                }
            }
        };
        let (result, ()) = tokio::join!(self.runner.run(&entry.group, input, tx), pump);

        if let Some(process) = entry.process() {
            process.mark_exited();
        }
        if let Err(e) = &result {
            warn!(chat_jid = %chat_jid, error = %e, "Warm container exited with error");
            if let Some(sink) = entry.sink() {
                let _ = sink.send(ContainerOutput::error(e.to_string()));
            }
        }

        let claimed = {
            let mut entries = self.entries();
            let claimed = entry.claimed.load(Ordering::SeqCst);
            if !claimed && entries.get(&chat_jid).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                entries.remove(&chat_jid);
            }
            claimed
        };

        if claimed {
            info!(chat_jid = %chat_jid, "Claimed container exited");
            self.queue.mark_inactive(&chat_jid);
        } else {
            info!(chat_jid = %chat_jid, "Standby exited unclaimed");
            self.queue.release_standby();
        }
        // Release the sink so the consumer sees the end of the stream.
        entry.sink.lock().unwrap_or_else(|e| e.into_inner()).take();

        self.schedule_respawn(chat_jid, entry.group.clone());
    }

    fn schedule_respawn(self: Arc<Self>, chat_jid: String, group: RegisteredGroup) {
        if self.queue.is_shutting_down() {
            return;
        }
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.config.respawn_delay).await;
                match self.prewarm(&chat_jid, &group, None) {
                    PrewarmOutcome::AtCapacity => {
                        debug!(chat_jid = %chat_jid, "Respawn deferred, host at capacity");
                    }
                    outcome => {
                        debug!(chat_jid = %chat_jid, ?outcome, "Respawn attempted");
                        break;
                    }
                }
            }
        });
    }
}
