//! Outbound file delivery.
//!
//! Polls every group's `files/` directory and hands authorized requests to
//! the owning channel's file capability. Rejected requests are quarantined.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::ChannelRegistry;
use crate::config::Config;
use crate::error::IpcError;
use crate::group_folder::{ensure_within_base, normalize_lexical, resolve_group_folder_path};
use crate::ipc::{FileRequest, IpcBridge, OutboundEnvelope};
use crate::types::RegisteredGroup;

/// Container-side mount point of the group folder.
const CONTAINER_GROUP_PREFIX: &str = "/workspace/group/";

/// Read access to the current registered-group map.
pub trait GroupRegistry: Send + Sync {
    fn registered_groups(&self) -> HashMap<String, RegisteredGroup>;
}

/// Check that `source_folder` may send `request`, and resolve the host path.
///
/// Non-main groups may only deliver to their own chat. The path must stay
/// inside the sender's group folder after normalization.
pub fn authorize_file_request(
    request: &FileRequest,
    source_folder: &str,
    groups: &HashMap<String, RegisteredGroup>,
    groups_dir: &Path,
) -> Result<PathBuf, String> {
    if let Some(field) = request.missing_field() {
        return Err(format!("missing required field {field}"));
    }

    if !Config::is_main_folder(source_folder) {
        let owns_target = groups
            .get(&request.chat_jid)
            .is_some_and(|g| g.folder == source_folder);
        if !owns_target {
            return Err(format!(
                "group {source_folder} may not send files to {}",
                request.chat_jid
            ));
        }
    }

    let group_dir = resolve_group_folder_path(groups_dir, source_folder).map_err(|e| e.to_string())?;

    let relative = request
        .file_path
        .strip_prefix(CONTAINER_GROUP_PREFIX)
        .unwrap_or(&request.file_path);
    let relative = Path::new(relative);
    if relative.is_absolute() {
        return Err(format!("absolute path rejected: {}", request.file_path));
    }
    let normalized = normalize_lexical(relative)
        .ok_or_else(|| format!("path traversal rejected: {}", request.file_path))?;

    let host_path = group_dir.join(normalized);
    ensure_within_base(&group_dir, &host_path).map_err(|e| e.to_string())?;
    Ok(host_path)
}

/// Polls `files/` directories and delivers files through channels.
pub struct FileSender {
    bridge: IpcBridge,
    groups_dir: PathBuf,
    channels: ChannelRegistry,
    registry: Arc<dyn GroupRegistry>,
    poll_interval: Duration,
}

enum Outcome {
    Sent,
    Retry,
    Reject(String),
}

impl FileSender {
    pub fn new(
        bridge: IpcBridge,
        groups_dir: PathBuf,
        channels: ChannelRegistry,
        registry: Arc<dyn GroupRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bridge,
            groups_dir,
            channels,
            registry,
            poll_interval,
        }
    }

    /// Run the poll loop until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        info!("File sender started");
        tokio::spawn(async move {
            loop {
                self.process_once().await;
                tokio::time::sleep(self.poll_interval).await;
            }
        })
    }

    /// One pass over every group. Returns the number of files delivered.
    pub async fn process_once(&self) -> usize {
        let folders = match self.bridge.group_folders() {
            Ok(folders) => folders,
            Err(e) => {
                error!(error = %e, "File sender: error reading IPC base directory");
                return 0;
            }
        };

        let groups = self.registry.registered_groups();
        let mut sent = 0;

        for folder in folders {
            let files_dir = match self.bridge.files_dir(&folder) {
                Ok(dir) => dir,
                Err(e) => {
                    debug!(folder = %folder, error = %e, "File sender: skipping directory");
                    continue;
                }
            };
            let pending = match self.bridge.pending_envelopes(&files_dir) {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(folder = %folder, error = %e, "File sender: cannot list files dir");
                    continue;
                }
            };

            for path in pending {
                match self.handle_envelope(&path, &folder, &groups).await {
                    Outcome::Sent => {
                        sent += 1;
                        if let Err(e) = self.bridge.consume(&path) {
                            warn!(file = %path.display(), error = %e, "File sender: failed to remove handled request");
                        }
                    }
                    Outcome::Retry => {}
                    Outcome::Reject(reason) => {
                        warn!(source_group = %folder, file = %path.display(), reason = %reason, "File sender: request rejected");
                        if let Err(e) = self.bridge.quarantine(&path, &folder) {
                            error!(file = %path.display(), error = %e, "File sender: quarantine failed");
                        }
                    }
                }
            }
        }
        sent
    }

    async fn handle_envelope(
        &self,
        path: &Path,
        source_folder: &str,
        groups: &HashMap<String, RegisteredGroup>,
    ) -> Outcome {
        let request = match self.bridge.read_envelope::<OutboundEnvelope>(path) {
            Ok(OutboundEnvelope::File(request)) => request,
            Err(IpcError::Io { source, .. }) => {
                debug!(file = %path.display(), error = %source, "File sender: unreadable, retrying next tick");
                return Outcome::Retry;
            }
            Err(e) => return Outcome::Reject(e.to_string()),
        };

        let host_path = match authorize_file_request(&request, source_folder, groups, &self.groups_dir) {
            Ok(path) => path,
            Err(reason) => return Outcome::Reject(reason),
        };

        let Some(channel) = self.channels.find(&request.chat_jid) else {
            return Outcome::Reject(format!("no channel owns {}", request.chat_jid));
        };
        let Some(delivery) = channel.file_delivery() else {
            return Outcome::Reject(format!("channel {} cannot send files", channel.name()));
        };

        if !host_path.is_file() {
            return Outcome::Reject(format!("file not found on host: {}", host_path.display()));
        }

        match delivery
            .send_file(
                &request.chat_jid,
                &host_path,
                &request.filename,
                request.mime_type.as_deref(),
                request.caption.as_deref(),
            )
            .await
        {
            Ok(()) => {
                info!(
                    chat_jid = %request.chat_jid,
                    filename = %request.filename,
                    source_group = %source_folder,
                    "File sent via IPC"
                );
                Outcome::Sent
            }
            Err(e) => Outcome::Reject(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{Channel, FileDelivery, MessageStream};
    use crate::error::ChannelError;

    struct StaticGroups(HashMap<String, RegisteredGroup>);

    impl GroupRegistry for StaticGroups {
        fn registered_groups(&self) -> HashMap<String, RegisteredGroup> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct FileChannel {
        sent: Mutex<Vec<(String, PathBuf)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Channel for FileChannel {
        fn name(&self) -> &str {
            "test"
        }
        fn owns_jid(&self, jid: &str) -> bool {
            jid.starts_with("test:")
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn connect(&self) -> Result<MessageStream, ChannelError> {
            Ok(Box::pin(futures::stream::empty()))
        }
        async fn send_message(&self, _jid: &str, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ChannelError> {
            Ok(())
        }
        fn file_delivery(&self) -> Option<&dyn FileDelivery> {
            Some(self)
        }
    }

    #[async_trait]
    impl FileDelivery for FileChannel {
        async fn send_file(
            &self,
            jid: &str,
            path: &Path,
            _filename: &str,
            _mime_type: Option<&str>,
            _caption: Option<&str>,
        ) -> Result<(), ChannelError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChannelError::SendFailed {
                    name: "test".to_string(),
                    reason: "boom".to_string(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((jid.to_string(), path.to_path_buf()));
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        groups_dir: PathBuf,
        bridge: IpcBridge,
        channel: Arc<FileChannel>,
        sender: FileSender,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let groups_dir = dir.path().join("groups");
        let bridge = IpcBridge::new(dir.path().join("data"));

        let mut groups = HashMap::new();
        for (jid, folder) in [("test:family", "family"), ("test:work", "work"), ("test:main", "main")] {
            groups.insert(jid.to_string(), RegisteredGroup::new(folder, folder, jid, "test"));
            std::fs::create_dir_all(groups_dir.join(folder)).unwrap();
            bridge.ensure_group_dirs(folder).unwrap();
        }

        let channel = Arc::new(FileChannel::default());
        let mut channels = ChannelRegistry::new();
        channels.add(channel.clone());

        let sender = FileSender::new(
            bridge.clone(),
            groups_dir.clone(),
            channels,
            Arc::new(StaticGroups(groups)),
            Duration::from_millis(10),
        );
        Fixture {
            _dir: dir,
            groups_dir,
            bridge,
            channel,
            sender,
        }
    }

    fn request(jid: &str, path: &str) -> OutboundEnvelope {
        OutboundEnvelope::File(FileRequest {
            chat_jid: jid.to_string(),
            file_path: path.to_string(),
            filename: "report.pdf".to_string(),
            mime_type: None,
            caption: None,
        })
    }

    fn errors(bridge: &IpcBridge) -> Vec<String> {
        match std::fs::read_dir(bridge.errors_dir()) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn delivers_own_file_and_consumes_request() {
        let f = fixture();
        std::fs::write(f.groups_dir.join("family/report.pdf"), b"%PDF").unwrap();
        let dir = f.bridge.files_dir("family").unwrap();
        f.bridge
            .write_envelope(&dir, &request("test:family", "/workspace/group/report.pdf"))
            .unwrap();

        assert_eq!(f.sender.process_once().await, 1);
        let sent = f.channel.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("test:family".to_string(), f.groups_dir.join("family/report.pdf"))]);
        assert!(f.bridge.pending_envelopes(&dir).unwrap().is_empty());
        assert!(errors(&f.bridge).is_empty());
    }

    #[tokio::test]
    async fn cross_group_request_is_quarantined_not_delivered() {
        let f = fixture();
        std::fs::write(f.groups_dir.join("family/report.pdf"), b"%PDF").unwrap();
        let dir = f.bridge.files_dir("family").unwrap();
        f.bridge
            .write_envelope(&dir, &request("test:work", "report.pdf"))
            .unwrap();

        assert_eq!(f.sender.process_once().await, 0);
        assert!(f.channel.sent.lock().unwrap().is_empty());
        let quarantined = errors(&f.bridge);
        assert_eq!(quarantined.len(), 1);
        assert!(quarantined[0].starts_with("family-"));
    }

    #[tokio::test]
    async fn main_group_may_deliver_anywhere() {
        let f = fixture();
        std::fs::write(f.groups_dir.join("main/report.pdf"), b"%PDF").unwrap();
        let dir = f.bridge.files_dir("main").unwrap();
        f.bridge
            .write_envelope(&dir, &request("test:work", "report.pdf"))
            .unwrap();

        assert_eq!(f.sender.process_once().await, 1);
    }

    #[tokio::test]
    async fn malformed_and_failed_sends_are_quarantined() {
        let f = fixture();
        let dir = f.bridge.files_dir("family").unwrap();
        std::fs::write(dir.join("1-aaaa.json"), b"{broken").unwrap();
        f.bridge
            .write_envelope(&dir, &request("test:family", "missing.pdf"))
            .unwrap();

        assert_eq!(f.sender.process_once().await, 0);
        assert_eq!(errors(&f.bridge).len(), 2);

        std::fs::write(f.groups_dir.join("family/report.pdf"), b"%PDF").unwrap();
        f.channel.fail.store(true, Ordering::SeqCst);
        f.bridge
            .write_envelope(&dir, &request("test:family", "report.pdf"))
            .unwrap();
        assert_eq!(f.sender.process_once().await, 0);
        assert_eq!(errors(&f.bridge).len(), 3);
    }

    #[test]
    fn authorization_rejects_traversal_and_absolute_paths() {
        let groups_dir = Path::new("/srv/groups");
        let mut groups = HashMap::new();
        groups.insert(
            "test:family".to_string(),
            RegisteredGroup::new("family", "family", "test:family", "test"),
        );
        let req = |path: &str| FileRequest {
            chat_jid: "test:family".to_string(),
            file_path: path.to_string(),
            filename: "x".to_string(),
            mime_type: None,
            caption: None,
        };

        assert_eq!(
            authorize_file_request(&req("out/./x.pdf"), "family", &groups, groups_dir).unwrap(),
            PathBuf::from("/srv/groups/family/out/x.pdf")
        );
        assert!(authorize_file_request(&req("../work/secret"), "family", &groups, groups_dir).is_err());
        assert!(authorize_file_request(&req("/etc/passwd"), "family", &groups, groups_dir).is_err());
        assert!(
            authorize_file_request(&req("/workspace/group/../../etc/passwd"), "family", &groups, groups_dir)
                .is_err()
        );
        assert!(authorize_file_request(&req("x.pdf"), "work", &groups, groups_dir).is_err());
    }
}
