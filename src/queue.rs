//! Group queue: per-chat serialization and global admission control.
//!
//! Each chat has a lane holding at most one active container. Work that
//! arrives while a lane is busy is recorded as pending and drained when the
//! lane frees up. Work that arrives while the host is at its container
//! ceiling joins a FIFO waiting list. Standby containers owned by the warm
//! pool are counted against the same ceiling, inside the same lock, so
//! `active + standby <= max_concurrent` holds at every instant.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::container::ProcessHandle;
use crate::ipc::IpcBridge;

/// Executes one cold-start turn for a chat.
///
/// Returns `false` when the turn failed and should be retried.
#[async_trait]
pub trait TurnProcessor: Send + Sync {
    async fn process_messages(&self, chat_jid: &str) -> bool;
}

/// One-shot scheduled task run under the chat's lane.
pub type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Settings for [`GroupQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ceiling on active + standby containers.
    pub max_concurrent: usize,
    pub max_retries: u32,
    /// First retry delay; doubles on each further attempt.
    pub base_retry: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 5,
            base_retry: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for QueueConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent_containers.max(1),
            ..Self::default()
        }
    }
}

struct PendingTask {
    id: String,
    run: TaskFn,
}

#[derive(Default)]
struct Lane {
    active: bool,
    idle_waiting: bool,
    is_task_container: bool,
    pending_messages: bool,
    pending_tasks: VecDeque<PendingTask>,
    process: Option<ProcessHandle>,
    group_folder: Option<String>,
    retry_count: u32,
    idle_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<String, Lane>,
    active_count: usize,
    standby_count: usize,
    waiting: VecDeque<String>,
    shutting_down: bool,
}

impl QueueState {
    fn lane(&mut self, chat_jid: &str) -> &mut Lane {
        self.lanes.entry(chat_jid.to_string()).or_default()
    }

    fn in_use(&self) -> usize {
        self.active_count + self.standby_count
    }

    fn enqueue_waiting(&mut self, chat_jid: &str) {
        if !self.waiting.iter().any(|j| j == chat_jid) {
            self.waiting.push_back(chat_jid.to_string());
        }
    }
}

/// Work picked under the lock, started after it is released.
enum Start {
    Messages(String),
    Task(String, PendingTask),
}

/// Per-chat admission and serialization.
pub struct GroupQueue {
    config: QueueConfig,
    bridge: IpcBridge,
    state: Mutex<QueueState>,
    processor: Mutex<Option<Arc<dyn TurnProcessor>>>,
}

impl GroupQueue {
    pub fn new(config: QueueConfig, bridge: IpcBridge) -> Arc<Self> {
        Arc::new(Self {
            config,
            bridge,
            state: Mutex::new(QueueState::default()),
            processor: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    /// Install the hook that executes cold-start turns.
    pub fn set_process_messages_fn(&self, processor: Arc<dyn TurnProcessor>) {
        *self.processor.lock().unwrap_or_else(|e| e.into_inner()) = Some(processor);
    }

    /// Active (non-standby) containers.
    pub fn get_active_count(&self) -> usize {
        self.state().active_count
    }

    /// Standby containers counted against the ceiling.
    pub fn standby_count(&self) -> usize {
        self.state().standby_count
    }

    pub fn is_active(&self, chat_jid: &str) -> bool {
        self.state().lanes.get(chat_jid).is_some_and(|l| l.active)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    // ── Process bookkeeping ─────────────────────────────────────────

    /// Record the running container for an active lane.
    pub fn register_process(&self, chat_jid: &str, handle: ProcessHandle, group_folder: &str) {
        let mut state = self.state();
        let lane = state.lane(chat_jid);
        let replaced_live = lane
            .process
            .as_ref()
            .filter(|p| p.container_name() != handle.container_name() && !p.has_exited());
        if let Some(previous) = replaced_live {
            warn!(
                chat_jid = %chat_jid,
                previous = %previous.container_name(),
                container = %handle.container_name(),
                "Replacing live process handle"
            );
        }
        debug!(chat_jid = %chat_jid, container = %handle.container_name(), "Process registered");
        lane.process = Some(handle);
        lane.group_folder = Some(group_folder.to_string());
    }

    /// Mark a lane active outside the cold-start path.
    pub fn mark_active(&self, chat_jid: &str, group_folder: &str) {
        let mut state = self.state();
        let lane = state.lane(chat_jid);
        if lane.active {
            return;
        }
        lane.active = true;
        lane.idle_waiting = false;
        lane.is_task_container = false;
        lane.group_folder = Some(group_folder.to_string());
        state.active_count += 1;
    }

    /// Release a lane marked active with [`mark_active`](Self::mark_active).
    pub fn mark_inactive(self: &Arc<Self>, chat_jid: &str) {
        let starts = {
            let mut state = self.state();
            if !state.lanes.get(chat_jid).is_some_and(|l| l.active) {
                debug!(chat_jid = %chat_jid, "mark_inactive on idle lane ignored");
                return;
            }
            Self::release_lane(&mut state, chat_jid);
            self.drain_group(&mut state, chat_jid)
        };
        self.start_all(starts);
    }

    /// Take over a standby container: register its process, mark the lane
    /// active and return its slot from standby to active in one step.
    /// Fails when the lane already has an active container.
    pub fn adopt_standby(&self, chat_jid: &str, handle: ProcessHandle, group_folder: &str) -> bool {
        let mut state = self.state();
        if state.shutting_down {
            return false;
        }
        let lane = state.lane(chat_jid);
        if lane.active {
            return false;
        }
        lane.active = true;
        lane.idle_waiting = false;
        lane.is_task_container = false;
        lane.process = Some(handle);
        lane.group_folder = Some(group_folder.to_string());
        state.active_count += 1;
        state.standby_count = state.standby_count.saturating_sub(1);
        true
    }

    // ── Standby accounting ──────────────────────────────────────────

    /// Reserve a ceiling slot for a standby container.
    pub fn try_reserve_standby(&self) -> bool {
        let mut state = self.state();
        if state.shutting_down || state.in_use() >= self.config.max_concurrent {
            return false;
        }
        state.standby_count += 1;
        true
    }

    /// Return a standby slot without promoting it and let waiting chats in.
    pub fn release_standby(self: &Arc<Self>) {
        let starts = {
            let mut state = self.state();
            state.standby_count = state.standby_count.saturating_sub(1);
            self.drain_waiting(&mut state)
        };
        self.start_all(starts);
    }

    // ── Input ───────────────────────────────────────────────────────

    /// Pipe `text` into the chat's running container.
    ///
    /// Returns `false` when there is nothing to pipe into; the caller must
    /// claim a standby or cold-start instead.
    pub fn send_message(&self, chat_jid: &str, text: &str) -> bool {
        let folder = {
            let mut state = self.state();
            let Some(lane) = state.lanes.get_mut(chat_jid) else {
                return false;
            };
            if !lane.active || lane.is_task_container || lane.process.is_none() {
                return false;
            }
            let Some(folder) = lane.group_folder.clone() else {
                return false;
            };
            lane.idle_waiting = false;
            folder
        };

        match self.bridge.send_input(&folder, text) {
            Ok(_) => true,
            Err(e) => {
                warn!(chat_jid = %chat_jid, error = %e, "Failed to pipe message into container");
                false
            }
        }
    }

    /// Ask the chat's container to finish and exit.
    pub fn close_stdin(&self, chat_jid: &str) {
        let folder = {
            let state = self.state();
            match state.lanes.get(chat_jid) {
                Some(lane) if lane.active => lane.group_folder.clone(),
                _ => None,
            }
        };
        if let Some(folder) = folder {
            match self.bridge.request_close(&folder) {
                Ok(()) => debug!(chat_jid = %chat_jid, "Close requested"),
                Err(e) => warn!(chat_jid = %chat_jid, error = %e, "Failed to write close sentinel"),
            }
        }
    }

    /// The agent finished a turn and is idling in its poll loop.
    pub fn notify_idle(&self, chat_jid: &str) {
        let close = {
            let mut state = self.state();
            let lane = state.lane(chat_jid);
            lane.idle_waiting = true;
            !lane.pending_tasks.is_empty()
        };
        if close {
            self.close_stdin(chat_jid);
        }
    }

    // ── Idle timer ──────────────────────────────────────────────────

    /// (Re)start the lane's idle timer; on expiry the container is closed.
    pub fn reset_idle_timer(self: &Arc<Self>, chat_jid: &str, after: Duration) {
        let this = Arc::clone(self);
        let jid = chat_jid.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!(chat_jid = %jid, "Idle timeout, closing container stdin");
            this.close_stdin(&jid);
        });

        let mut state = self.state();
        if let Some(old) = state.lane(chat_jid).idle_timer.replace(timer) {
            old.abort();
        }
    }

    pub fn clear_idle_timer(&self, chat_jid: &str) {
        let mut state = self.state();
        if let Some(timer) = state.lanes.get_mut(chat_jid).and_then(|l| l.idle_timer.take()) {
            timer.abort();
        }
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// Request a cold-start turn. Deferred, never dropped, when the lane is
    /// busy or the host is at its ceiling.
    pub fn enqueue_message_check(self: &Arc<Self>, chat_jid: &str) {
        let start = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let at_limit = state.in_use() >= self.config.max_concurrent;
            let lane = state.lane(chat_jid);
            if lane.active {
                lane.pending_messages = true;
                debug!(chat_jid = %chat_jid, "Container active, message check queued");
                return;
            }
            if at_limit {
                lane.pending_messages = true;
                state.enqueue_waiting(chat_jid);
                debug!(
                    chat_jid = %chat_jid,
                    active = state.active_count,
                    standby = state.standby_count,
                    "At concurrency limit, message check deferred"
                );
                return;
            }
            Self::begin_messages(&mut state, chat_jid)
        };
        self.start_all(vec![start]);
    }

    /// Run a one-shot task under the chat's lane. Duplicate ids are ignored.
    pub fn enqueue_task(self: &Arc<Self>, chat_jid: &str, task_id: &str, run: TaskFn) {
        let start = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let at_limit = state.in_use() >= self.config.max_concurrent;
            let lane = state.lane(chat_jid);
            if lane.pending_tasks.iter().any(|t| t.id == task_id) {
                debug!(chat_jid = %chat_jid, task_id, "Task already queued, skipping");
                return;
            }
            let task = PendingTask {
                id: task_id.to_string(),
                run,
            };
            if lane.active {
                lane.pending_tasks.push_back(task);
                let idle = lane.idle_waiting;
                drop(state);
                if idle {
                    self.close_stdin(chat_jid);
                }
                debug!(chat_jid = %chat_jid, task_id, "Container active, task queued");
                return;
            }
            if at_limit {
                lane.pending_tasks.push_back(task);
                state.enqueue_waiting(chat_jid);
                debug!(chat_jid = %chat_jid, task_id, "At concurrency limit, task queued");
                return;
            }
            Self::begin_task(&mut state, chat_jid, task)
        };
        self.start_all(vec![start]);
    }

    fn begin_messages(state: &mut QueueState, chat_jid: &str) -> Start {
        let lane = state.lane(chat_jid);
        lane.active = true;
        lane.idle_waiting = false;
        lane.is_task_container = false;
        lane.pending_messages = false;
        state.active_count += 1;
        Start::Messages(chat_jid.to_string())
    }

    fn begin_task(state: &mut QueueState, chat_jid: &str, task: PendingTask) -> Start {
        let lane = state.lane(chat_jid);
        lane.active = true;
        lane.idle_waiting = false;
        lane.is_task_container = true;
        state.active_count += 1;
        Start::Task(chat_jid.to_string(), task)
    }

    fn release_lane(state: &mut QueueState, chat_jid: &str) {
        let lane = state.lane(chat_jid);
        lane.active = false;
        lane.idle_waiting = false;
        lane.is_task_container = false;
        lane.process = None;
        lane.group_folder = None;
        if let Some(timer) = lane.idle_timer.take() {
            timer.abort();
        }
        state.active_count = state.active_count.saturating_sub(1);
    }

    /// Next work for a lane that just freed up, then waiting chats.
    fn drain_group(&self, state: &mut QueueState, chat_jid: &str) -> Vec<Start> {
        if state.shutting_down {
            return Vec::new();
        }
        let lane = state.lane(chat_jid);
        if let Some(task) = lane.pending_tasks.pop_front() {
            return vec![Self::begin_task(state, chat_jid, task)];
        }
        if lane.pending_messages {
            return vec![Self::begin_messages(state, chat_jid)];
        }
        self.drain_waiting(state)
    }

    fn drain_waiting(&self, state: &mut QueueState) -> Vec<Start> {
        let mut starts = Vec::new();
        if state.shutting_down {
            return starts;
        }
        while state.in_use() < self.config.max_concurrent {
            let Some(jid) = state.waiting.pop_front() else {
                break;
            };
            let lane = state.lane(&jid);
            if lane.active {
                // Picked up again when its current container exits.
                continue;
            }
            if let Some(task) = lane.pending_tasks.pop_front() {
                starts.push(Self::begin_task(state, &jid, task));
            } else if lane.pending_messages {
                starts.push(Self::begin_messages(state, &jid));
            }
        }
        starts
    }

    fn start_all(self: &Arc<Self>, starts: Vec<Start>) {
        for start in starts {
            match start {
                Start::Messages(jid) => self.spawn_messages(jid),
                Start::Task(jid, task) => self.spawn_task(jid, task),
            }
        }
    }

    fn spawn_messages(self: &Arc<Self>, chat_jid: String) {
        let this = Arc::clone(self);
        let processor = self.processor.lock().unwrap_or_else(|e| e.into_inner()).clone();
        tokio::spawn(async move {
            let success = match processor {
                Some(processor) => {
                    let jid = chat_jid.clone();
                    match tokio::spawn(async move { processor.process_messages(&jid).await }).await {
                        Ok(success) => success,
                        Err(e) => {
                            error!(chat_jid = %chat_jid, error = %e, "Turn processor panicked");
                            false
                        }
                    }
                }
                None => {
                    warn!(chat_jid = %chat_jid, "No turn processor installed, dropping message check");
                    true
                }
            };
            this.finish_messages(&chat_jid, success);
        });
    }

    fn spawn_task(self: &Arc<Self>, chat_jid: String, task: PendingTask) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            debug!(chat_jid = %chat_jid, task_id = %task.id, "Running queued task");
            if let Err(e) = tokio::spawn((task.run)()).await {
                error!(chat_jid = %chat_jid, task_id = %task.id, error = %e, "Task panicked");
            }
            let starts = {
                let mut state = this.state();
                Self::release_lane(&mut state, &chat_jid);
                this.drain_group(&mut state, &chat_jid)
            };
            this.start_all(starts);
        });
    }

    fn finish_messages(self: &Arc<Self>, chat_jid: &str, success: bool) {
        let (starts, retry_delay) = {
            let mut state = self.state();
            let retry_delay = {
                let lane = state.lane(chat_jid);
                if success {
                    lane.retry_count = 0;
                    None
                } else {
                    lane.retry_count += 1;
                    if lane.retry_count > self.config.max_retries {
                        error!(
                            chat_jid = %chat_jid,
                            retries = self.config.max_retries,
                            "Max retries exceeded, waiting for next inbound message"
                        );
                        lane.retry_count = 0;
                        None
                    } else {
                        let factor = 2u32.saturating_pow(lane.retry_count - 1);
                        Some((self.config.base_retry * factor, lane.retry_count))
                    }
                }
            };
            Self::release_lane(&mut state, chat_jid);
            (self.drain_group(&mut state, chat_jid), retry_delay)
        };

        if let Some((delay, attempt)) = retry_delay {
            info!(chat_jid = %chat_jid, attempt, ?delay, "Scheduling retry with backoff");
            let this = Arc::clone(self);
            let jid = chat_jid.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.enqueue_message_check(&jid);
            });
        }
        self.start_all(starts);
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Ask every active container to wind down, wait up to `grace`, then
    /// force-stop whatever is still running.
    pub async fn shutdown(&self, grace: Duration) {
        let chats: Vec<String> = {
            let mut state = self.state();
            state.shutting_down = true;
            state.waiting.clear();
            for lane in state.lanes.values_mut() {
                if let Some(timer) = lane.idle_timer.take() {
                    timer.abort();
                }
            }
            state
                .lanes
                .iter()
                .filter(|(_, lane)| lane.active)
                .map(|(jid, _)| jid.clone())
                .collect()
        };

        info!(active = chats.len(), ?grace, "Queue shutting down");
        for jid in &chats {
            self.close_stdin(jid);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.get_active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let stragglers: Vec<ProcessHandle> = {
            let state = self.state();
            state
                .lanes
                .values()
                .filter(|lane| lane.active)
                .filter_map(|lane| lane.process.clone())
                .filter(|p| !p.has_exited())
                .collect()
        };
        for process in stragglers {
            warn!(container = %process.container_name(), "Force-stopping container after grace period");
            process.kill();
        }
    }
}
