//! Orchestrator: coordinator module.
//!
//! Owns the router state (cursors, sessions, registered groups) and wires
//! the queue, the warm pool and the channels together.
//!
//! Extracted modules:
//! - `delivery`: the poll tick, warm-claim output handling, startup recovery
//! - `turn`: cold-start turns run by the queue

mod delivery;
mod turn;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::channels::ChannelRegistry;
use crate::config::Config;
use crate::container::ContainerRunner;
use crate::error;
use crate::group_folder::{assert_valid_group_folder, resolve_group_folder_path};
use crate::ipc::IpcBridge;
use crate::ipc::file_sender::GroupRegistry;
use crate::queue::{GroupQueue, QueueConfig, TurnProcessor};
use crate::store::{Database, LAST_AGENT_TIMESTAMP_KEY, LAST_TIMESTAMP_KEY};
use crate::types::{NewMessage, RegisteredGroup};
use crate::warm_pool::{WarmPool, WarmPoolConfig};

/// Shared collaborators of the orchestrator.
pub struct OrchestratorDeps {
    pub db: Arc<dyn Database>,
    pub runner: Arc<dyn ContainerRunner>,
    pub channels: ChannelRegistry,
}

/// In-memory mirror of the persisted router state.
#[derive(Debug, Default)]
pub(crate) struct RouterState {
    /// Global-seen cursor.
    pub(crate) last_timestamp: String,
    /// Agent-seen cursor per chat.
    pub(crate) last_agent_timestamp: HashMap<String, String>,
    /// Agent session per group folder.
    pub(crate) sessions: HashMap<String, String>,
    pub(crate) registered_groups: HashMap<String, RegisteredGroup>,
}

/// Routes stored messages to agent containers.
pub struct Orchestrator {
    pub(crate) config: Config,
    pub(crate) trigger: Regex,
    pub(crate) deps: OrchestratorDeps,
    pub(crate) bridge: IpcBridge,
    pub(crate) queue: Arc<GroupQueue>,
    pub(crate) warm_pool: Option<Arc<WarmPool>>,
    state: Mutex<RouterState>,
    pub(crate) loop_running: AtomicBool,
}

/// Lets the queue run cold-start turns without owning the orchestrator.
struct QueueHook {
    orchestrator: Weak<Orchestrator>,
}

#[async_trait]
impl TurnProcessor for QueueHook {
    async fn process_messages(&self, chat_jid: &str) -> bool {
        match self.orchestrator.upgrade() {
            Some(orchestrator) => orchestrator.process_group_messages(chat_jid).await,
            None => true,
        }
    }
}

impl Orchestrator {
    /// Build the orchestrator and install it as the queue's turn processor.
    pub fn new(config: Config, deps: OrchestratorDeps) -> error::Result<Arc<Self>> {
        let trigger = config.trigger_pattern()?;
        let bridge = IpcBridge::new(config.data_dir());
        let queue = GroupQueue::new(QueueConfig::from(&config), bridge.clone());
        let warm_pool = config.warm_pool_enabled.then(|| {
            WarmPool::new(
                Arc::clone(&queue),
                Arc::clone(&deps.runner),
                WarmPoolConfig::from(&config),
            )
        });

        let orchestrator = Arc::new_cyclic(|weak| {
            queue.set_process_messages_fn(Arc::new(QueueHook {
                orchestrator: weak.clone(),
            }));
            Self {
                config,
                trigger,
                deps,
                bridge,
                queue,
                warm_pool,
                state: Mutex::new(RouterState::default()),
                loop_running: AtomicBool::new(false),
            }
        });
        Ok(orchestrator)
    }

    // ── Convenience accessors ───────────────────────────────────────

    pub(crate) fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn db(&self) -> &Arc<dyn Database> {
        &self.deps.db
    }

    pub fn queue(&self) -> &Arc<GroupQueue> {
        &self.queue
    }

    pub fn bridge(&self) -> &IpcBridge {
        &self.bridge
    }

    pub fn group(&self, chat_jid: &str) -> Option<RegisteredGroup> {
        self.state().registered_groups.get(chat_jid).cloned()
    }

    pub fn agent_cursor(&self, chat_jid: &str) -> String {
        self.state()
            .last_agent_timestamp
            .get(chat_jid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn global_cursor(&self) -> String {
        self.state().last_timestamp.clone()
    }

    /// Messages in `chat_jid` after `since` that the poll loop has already
    /// seen. Anything stored past the global cursor is left for the next
    /// tick, so the agent cursor never overtakes it.
    pub(crate) async fn agent_backlog(
        &self,
        chat_jid: &str,
        since: &str,
    ) -> Result<Vec<NewMessage>, error::DatabaseError> {
        let seen_up_to = self.global_cursor();
        let mut messages = self
            .db()
            .get_messages_since(chat_jid, since, &self.config.assistant_name)
            .await?;
        messages.retain(|m| m.timestamp <= seen_up_to);
        Ok(messages)
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Load cursors, sessions and registered groups from the store.
    pub async fn load_state(&self) -> error::Result<()> {
        let db = self.db();
        let last_timestamp = db.get_router_state(LAST_TIMESTAMP_KEY).await?.unwrap_or_default();
        let agent_raw = db.get_router_state(LAST_AGENT_TIMESTAMP_KEY).await?;
        let last_agent_timestamp = match agent_raw {
            Some(raw) => serde_json::from_str::<HashMap<String, String>>(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Corrupted last_agent_timestamp in store, resetting");
                HashMap::new()
            }),
            None => HashMap::new(),
        };
        let sessions = db.get_all_sessions().await?;
        let registered_groups = db.get_all_registered_groups().await?;

        if let Some(pool) = &self.warm_pool {
            for (folder, session) in &sessions {
                pool.update_session(folder, session);
            }
        }

        info!(group_count = registered_groups.len(), "State loaded");
        *self.state() = RouterState {
            last_timestamp,
            last_agent_timestamp,
            sessions,
            registered_groups,
        };
        Ok(())
    }

    /// Persist both cursors.
    pub async fn save_state(&self) -> error::Result<()> {
        let (last_timestamp, agent_json) = {
            let state = self.state();
            let agent_json = serde_json::to_string(&state.last_agent_timestamp)
                .map_err(|e| error::DatabaseError::Serialization(e.to_string()))?;
            (state.last_timestamp.clone(), agent_json)
        };
        let db = self.db();
        db.set_router_state(LAST_TIMESTAMP_KEY, &last_timestamp).await?;
        db.set_router_state(LAST_AGENT_TIMESTAMP_KEY, &agent_json).await?;
        Ok(())
    }

    /// Move a chat's agent-seen cursor and persist it.
    pub(crate) async fn set_agent_cursor(&self, chat_jid: &str, timestamp: &str) {
        self.state()
            .last_agent_timestamp
            .insert(chat_jid.to_string(), timestamp.to_string());
        if let Err(e) = self.save_state().await {
            warn!(chat_jid = %chat_jid, error = %e, "Failed to persist agent cursor");
        }
    }

    /// Record a new agent session for the group.
    pub(crate) async fn record_session(&self, group_folder: &str, session_id: &str) {
        let changed = {
            let mut state = self.state();
            let previous = state
                .sessions
                .insert(group_folder.to_string(), session_id.to_string());
            previous.as_deref() != Some(session_id)
        };
        if !changed {
            return;
        }
        if let Some(pool) = &self.warm_pool {
            pool.update_session(group_folder, session_id);
        }
        if let Err(e) = self.db().set_session(group_folder, session_id).await {
            warn!(group_folder = %group_folder, error = %e, "Failed to persist session");
        }
    }

    pub(crate) fn session_for(&self, group_folder: &str) -> Option<String> {
        self.state().sessions.get(group_folder).cloned()
    }

    // ── Groups ──────────────────────────────────────────────────────

    /// Register a chat and prepare its folders. Invalid folders are refused
    /// without any state change.
    pub async fn register_group(self: &Arc<Self>, group: RegisteredGroup) -> error::Result<()> {
        if let Err(e) = assert_valid_group_folder(&group.folder) {
            warn!(chat_jid = %group.jid, folder = %group.folder, "Rejecting group with invalid folder");
            return Err(e.into());
        }

        let group_dir = resolve_group_folder_path(&self.config.groups_dir(), &group.folder)?;
        let logs = group_dir.join("logs");
        std::fs::create_dir_all(&logs).map_err(|e| error::IpcError::io(&logs, e))?;
        self.bridge.ensure_group_dirs(&group.folder)?;

        self.db().set_registered_group(&group).await?;
        self.state()
            .registered_groups
            .insert(group.jid.clone(), group.clone());
        info!(chat_jid = %group.jid, group = %group.name, folder = %group.folder, "Group registered");

        self.prewarm(&group);
        Ok(())
    }

    /// Register `group` if nothing is registered yet. Returns whether it was
    /// added.
    pub async fn ensure_default_group(self: &Arc<Self>, group: RegisteredGroup) -> error::Result<bool> {
        if !self.state().registered_groups.is_empty() {
            return Ok(false);
        }
        self.register_group(group).await?;
        Ok(true)
    }

    /// Prewarm a standby for every registered chat.
    pub fn prewarm_all(&self) {
        let groups: Vec<RegisteredGroup> = self.state().registered_groups.values().cloned().collect();
        for group in &groups {
            self.prewarm(group);
        }
    }

    fn prewarm(&self, group: &RegisteredGroup) {
        let Some(pool) = &self.warm_pool else {
            return;
        };
        let session = self.session_for(&group.folder);
        let outcome = pool.prewarm(&group.jid, group, session.as_deref());
        debug!(chat_jid = %group.jid, ?outcome, "Prewarm requested");
    }
}

impl GroupRegistry for Orchestrator {
    fn registered_groups(&self) -> HashMap<String, RegisteredGroup> {
        self.state().registered_groups.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::channels::{Channel, MessageStream};
    use crate::container::testing::FakeRunner;
    use crate::error::ChannelError;
    use crate::store::LibSqlBackend;
    use crate::types::NewMessage;

    /// Channel that records what it was asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub(crate) sent: StdMutex<Vec<(String, String)>>,
        pub(crate) typing: StdMutex<Vec<(String, bool)>>,
        pub(crate) fail_sends: AtomicBool,
    }

    impl RecordingChannel {
        pub(crate) fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "test"
        }

        fn owns_jid(&self, jid: &str) -> bool {
            jid.starts_with("tg:")
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn connect(&self) -> Result<MessageStream, ChannelError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn send_message(&self, jid: &str, text: &str) -> Result<(), ChannelError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ChannelError::SendFailed {
                    name: "test".to_string(),
                    reason: "offline".to_string(),
                });
            }
            self.sent.lock().unwrap().push((jid.to_string(), text.to_string()));
            Ok(())
        }

        async fn set_typing(&self, jid: &str, typing: bool) -> Result<(), ChannelError> {
            self.typing.lock().unwrap().push((jid.to_string(), typing));
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    pub(crate) struct Fixture {
        pub(crate) _dir: tempfile::TempDir,
        pub(crate) root: PathBuf,
        pub(crate) db: Arc<LibSqlBackend>,
        pub(crate) runner: Arc<FakeRunner>,
        pub(crate) channel: Arc<RecordingChannel>,
        pub(crate) orchestrator: Arc<Orchestrator>,
    }

    pub(crate) async fn fixture(warm_pool_enabled: bool, runner: FakeRunner) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let config = Config {
            root_dir: root.clone(),
            warm_pool_enabled,
            ..Config::default()
        };
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.run_migrations().await.unwrap();
        let runner = Arc::new(runner);
        let channel = Arc::new(RecordingChannel::default());
        let mut channels = ChannelRegistry::new();
        channels.add(channel.clone());

        let orchestrator = Orchestrator::new(
            config,
            OrchestratorDeps {
                db: db.clone(),
                runner: runner.clone(),
                channels,
            },
        )
        .unwrap();
        orchestrator.load_state().await.unwrap();

        Fixture {
            _dir: dir,
            root,
            db,
            runner,
            channel,
            orchestrator,
        }
    }

    pub(crate) fn family() -> RegisteredGroup {
        RegisteredGroup::new("Family", "family", "tg:100", "telegram")
    }

    pub(crate) fn message(jid: &str, content: &str, ts: &str) -> NewMessage {
        NewMessage {
            id: format!("{jid}-{ts}"),
            chat_jid: jid.to_string(),
            sender: "u1".to_string(),
            sender_name: "Alice".to_string(),
            content: content.to_string(),
            timestamp: ts.to_string(),
            is_from_me: false,
            is_bot_message: false,
        }
    }

    pub(crate) async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn exists(root: &Path, rel: &str) -> bool {
        root.join(rel).exists()
    }

    #[tokio::test]
    async fn register_group_persists_and_creates_folders() {
        let f = fixture(false, FakeRunner::new()).await;
        f.orchestrator.register_group(family()).await.unwrap();

        assert!(exists(&f.root, "groups/family/logs"));
        assert!(exists(&f.root, "data/ipc/family/input"));
        let stored = f.db.get_all_registered_groups().await.unwrap();
        assert_eq!(stored["tg:100"].folder, "family");
        assert!(f.orchestrator.group("tg:100").is_some());
    }

    #[tokio::test]
    async fn register_group_rejects_invalid_folder() {
        let f = fixture(false, FakeRunner::new()).await;
        let bad = RegisteredGroup::new("Bad", "../etc", "tg:666", "telegram");
        assert!(f.orchestrator.register_group(bad).await.is_err());
        assert!(f.orchestrator.group("tg:666").is_none());
        assert!(f.db.get_all_registered_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_group_prewarms_when_pool_enabled() {
        let f = fixture(true, FakeRunner::new()).await;
        f.orchestrator.register_group(family()).await.unwrap();
        let inv = f.runner.next_invocation().await;
        assert_eq!(inv.input.prompt, crate::container::STANDBY_PROMPT);
    }

    #[tokio::test]
    async fn default_group_only_registered_on_empty_store() {
        let f = fixture(false, FakeRunner::new()).await;
        let local = RegisteredGroup::new("Local", "main", "tg:1", "telegram");
        assert!(f.orchestrator.ensure_default_group(local.clone()).await.unwrap());
        assert!(f.orchestrator.group("tg:1").is_some_and(|g| g.is_main()));

        // A restart with the group already stored leaves it alone.
        assert!(!f.orchestrator.ensure_default_group(family()).await.unwrap());
        assert!(f.orchestrator.group("tg:100").is_none());
        assert_eq!(f.db.get_all_registered_groups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_round_trips_through_store() {
        let f = fixture(false, FakeRunner::new()).await;
        f.orchestrator.set_agent_cursor("tg:100", "2024-01-01T00:00:01.000Z").await;
        f.orchestrator.state().last_timestamp = "2024-01-01T00:00:02.000Z".to_string();
        f.orchestrator.save_state().await.unwrap();
        f.orchestrator.record_session("family", "sess-1").await;

        *f.orchestrator.state() = RouterState::default();
        f.orchestrator.load_state().await.unwrap();
        assert_eq!(f.orchestrator.agent_cursor("tg:100"), "2024-01-01T00:00:01.000Z");
        assert_eq!(f.orchestrator.global_cursor(), "2024-01-01T00:00:02.000Z");
        assert_eq!(f.orchestrator.session_for("family").as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn corrupt_agent_cursor_map_resets() {
        let f = fixture(false, FakeRunner::new()).await;
        f.db.set_router_state(LAST_AGENT_TIMESTAMP_KEY, "{not json").await.unwrap();
        f.orchestrator.load_state().await.unwrap();
        assert_eq!(f.orchestrator.agent_cursor("tg:100"), "");
    }
}
