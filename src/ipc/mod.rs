//! Filesystem IPC between host and containers.
//!
//! Layout under `<data>/ipc/`:
//!
//! ```text
//! <folder>/input/*.json   host → container messages (plus the `_close` sentinel)
//! <folder>/files/*.json   container → host file delivery requests
//! errors/                 quarantined envelopes
//! ```
//!
//! Writers create `<name>.json.tmp` and rename it into place, so a reader
//! listing `*.json` never sees a partial file. Each envelope has one writer
//! and one reader, and the reader deletes it after handling.

pub mod envelope;
pub mod file_sender;

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::IpcError;
use crate::group_folder::resolve_group_ipc_path;

pub use envelope::{CLOSE_SENTINEL, FileRequest, InputEnvelope, OutboundEnvelope};

const ERRORS_DIR: &str = "errors";
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Handle on the IPC directory tree.
#[derive(Debug, Clone)]
pub struct IpcBridge {
    data_dir: PathBuf,
    base: PathBuf,
}

impl IpcBridge {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let base = data_dir.join("ipc");
        Self { data_dir, base }
    }

    /// `<ipc>/<folder>`, validated.
    pub fn group_dir(&self, folder: &str) -> Result<PathBuf, IpcError> {
        Ok(resolve_group_ipc_path(&self.data_dir, folder)?)
    }

    pub fn input_dir(&self, folder: &str) -> Result<PathBuf, IpcError> {
        Ok(self.group_dir(folder)?.join("input"))
    }

    pub fn files_dir(&self, folder: &str) -> Result<PathBuf, IpcError> {
        Ok(self.group_dir(folder)?.join("files"))
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.base.join(ERRORS_DIR)
    }

    /// Create `input/` and `files/` for a group.
    pub fn ensure_group_dirs(&self, folder: &str) -> Result<(), IpcError> {
        for dir in [self.input_dir(folder)?, self.files_dir(folder)?] {
            std::fs::create_dir_all(&dir).map_err(|e| IpcError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Atomically write `envelope` into `dir`. Returns the final path.
    pub fn write_envelope<T: Serialize>(&self, dir: &Path, envelope: &T) -> Result<PathBuf, IpcError> {
        std::fs::create_dir_all(dir).map_err(|e| IpcError::io(dir, e))?;
        let body = serde_json::to_vec(envelope)?;

        let path = dir.join(envelope_file_name());
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(|e| IpcError::io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(IpcError::io(&path, e));
        }
        Ok(path)
    }

    /// Drop a message into a running container's input channel.
    pub fn send_input(&self, folder: &str, text: &str) -> Result<PathBuf, IpcError> {
        let dir = self.input_dir(folder)?;
        let path = self.write_envelope(
            &dir,
            &InputEnvelope::Message {
                text: text.to_string(),
            },
        )?;
        debug!(group_folder = folder, file = %path.display(), "IPC input written");
        Ok(path)
    }

    /// Ask the container for `folder` to finish its turn and exit.
    pub fn request_close(&self, folder: &str) -> Result<(), IpcError> {
        let dir = self.input_dir(folder)?;
        std::fs::create_dir_all(&dir).map_err(|e| IpcError::io(&dir, e))?;
        let path = dir.join(CLOSE_SENTINEL);
        std::fs::write(&path, b"").map_err(|e| IpcError::io(&path, e))
    }

    /// Finished `*.json` envelopes in `dir`, oldest name first.
    pub fn pending_envelopes(&self, dir: &Path) -> Result<Vec<PathBuf>, IpcError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IpcError::io(dir, e)),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Read and parse one envelope.
    ///
    /// `IpcError::Io` means the file could not be read right now and may be
    /// retried; any other error means the content itself is bad.
    pub fn read_envelope<T: DeserializeOwned>(&self, path: &Path) -> Result<T, IpcError> {
        let raw = std::fs::read(path).map_err(|e| IpcError::io(path, e))?;
        serde_json::from_slice(&raw).map_err(|e| IpcError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Delete a handled envelope.
    pub fn consume(&self, path: &Path) -> Result<(), IpcError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IpcError::io(path, e)),
        }
    }

    /// Move a rejected envelope to `errors/<source_folder>-<file>`.
    pub fn quarantine(&self, path: &Path, source_folder: &str) -> Result<PathBuf, IpcError> {
        let errors = self.errors_dir();
        std::fs::create_dir_all(&errors).map_err(|e| IpcError::io(&errors, e))?;
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "envelope.json".to_string());
        let dest = errors.join(format!("{source_folder}-{file}"));
        std::fs::rename(path, &dest).map_err(|e| IpcError::io(path, e))?;
        warn!(source = %path.display(), dest = %dest.display(), "IPC envelope quarantined");
        Ok(dest)
    }

    /// Group folders that have an IPC directory.
    pub fn group_folders(&self) -> Result<Vec<String>, IpcError> {
        let entries = match std::fs::read_dir(&self.base) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IpcError::io(&self.base, e)),
        };
        let mut folders: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != ERRORS_DIR)
            .collect();
        folders.sort();
        Ok(folders)
    }

    /// Container side of the input channel: read, delete and return every
    /// pending message. Malformed entries are quarantined. Returns
    /// `closed = true` when the `_close` sentinel was present (and removes it).
    pub fn drain_inputs(&self, folder: &str) -> Result<(Vec<InputEnvelope>, bool), IpcError> {
        let dir = self.input_dir(folder)?;
        let mut messages = Vec::new();
        for path in self.pending_envelopes(&dir)? {
            match self.read_envelope::<InputEnvelope>(&path) {
                Ok(envelope) => {
                    self.consume(&path)?;
                    messages.push(envelope);
                }
                Err(IpcError::Io { .. }) => continue,
                Err(e) => {
                    warn!(error = %e, "Malformed input envelope");
                    self.quarantine(&path, folder)?;
                }
            }
        }

        let sentinel = dir.join(CLOSE_SENTINEL);
        let closed = sentinel.exists();
        if closed {
            self.consume(&sentinel)?;
        }
        Ok((messages, closed))
    }
}

/// `<millis>-<4 base36 chars>.json`
pub fn envelope_file_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{}-{suffix}.json", chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> (tempfile::TempDir, IpcBridge) {
        let dir = tempfile::tempdir().unwrap();
        let bridge = IpcBridge::new(dir.path().join("data"));
        (dir, bridge)
    }

    fn dir_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn file_names_have_expected_shape() {
        let name = envelope_file_name();
        let (stem, ext) = name.rsplit_once('.').unwrap();
        assert_eq!(ext, "json");
        let (millis, suffix) = stem.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 4);
        assert!(suffix.bytes().all(|b| BASE36.contains(&b)));
    }

    #[test]
    fn message_is_observed_exactly_once_and_no_tmp_remains() {
        let (_dir, bridge) = bridge();
        let path = bridge.send_input("family", "hello").unwrap();
        assert!(path.exists());

        let input = bridge.input_dir("family").unwrap();
        assert!(dir_names(&input).iter().all(|n| !n.ends_with(".tmp")));

        let (first, closed) = bridge.drain_inputs("family").unwrap();
        assert_eq!(
            first,
            vec![InputEnvelope::Message {
                text: "hello".to_string()
            }]
        );
        assert!(!closed);

        let (second, _) = bridge.drain_inputs("family").unwrap();
        assert!(second.is_empty());
        assert!(dir_names(&input).is_empty());
    }

    #[test]
    fn tmp_files_are_invisible_to_readers() {
        let (_dir, bridge) = bridge();
        let input = bridge.input_dir("family").unwrap();
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(input.join("123-abcd.json.tmp"), b"{\"type\":\"mess").unwrap();

        assert!(bridge.pending_envelopes(&input).unwrap().is_empty());
        let (msgs, _) = bridge.drain_inputs("family").unwrap();
        assert!(msgs.is_empty());
    }

    #[test]
    fn malformed_input_is_quarantined() {
        let (_dir, bridge) = bridge();
        let input = bridge.input_dir("family").unwrap();
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(input.join("1-zzzz.json"), b"not json").unwrap();

        let (msgs, _) = bridge.drain_inputs("family").unwrap();
        assert!(msgs.is_empty());
        assert_eq!(dir_names(&bridge.errors_dir()), vec!["family-1-zzzz.json"]);
    }

    #[test]
    fn close_sentinel_is_reported_once() {
        let (_dir, bridge) = bridge();
        bridge.request_close("family").unwrap();
        assert!(bridge.drain_inputs("family").unwrap().1);
        assert!(!bridge.drain_inputs("family").unwrap().1);
    }

    #[test]
    fn group_folders_skip_errors_dir() {
        let (_dir, bridge) = bridge();
        bridge.ensure_group_dirs("family").unwrap();
        bridge.ensure_group_dirs("main").unwrap();
        std::fs::create_dir_all(bridge.errors_dir()).unwrap();
        assert_eq!(bridge.group_folders().unwrap(), vec!["family", "main"]);
    }

    #[test]
    fn invalid_folder_is_rejected() {
        let (_dir, bridge) = bridge();
        assert!(matches!(
            bridge.send_input("../escape", "x"),
            Err(IpcError::Group(_))
        ));
    }
}
