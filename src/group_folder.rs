//! Group folder validation and path resolution.
//!
//! Every registered group owns `groups/<folder>/` and `data/ipc/<folder>/`.
//! Folder names come from registration input, so they are validated before
//! they ever touch the filesystem.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::GroupError;

const RESERVED_FOLDERS: &[&str] = &["global"];

fn folder_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").ok())
        .as_ref()
}

/// Whether `folder` is safe to use as a group directory name.
pub fn is_valid_group_folder(folder: &str) -> bool {
    if folder.is_empty() || folder != folder.trim() {
        return false;
    }
    if folder.contains('/') || folder.contains('\\') || folder.contains("..") {
        return false;
    }
    if RESERVED_FOLDERS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(folder))
    {
        return false;
    }
    folder_pattern().is_some_and(|re| re.is_match(folder))
}

/// Validate `folder`, returning a `GroupError` when it is unsafe.
pub fn assert_valid_group_folder(folder: &str) -> Result<(), GroupError> {
    if is_valid_group_folder(folder) {
        Ok(())
    } else {
        Err(GroupError::InvalidFolder(folder.to_string()))
    }
}

/// `<groups_dir>/<folder>`, validated.
pub fn resolve_group_folder_path(groups_dir: &Path, folder: &str) -> Result<PathBuf, GroupError> {
    assert_valid_group_folder(folder)?;
    let path = groups_dir.join(folder);
    ensure_within_base(groups_dir, &path)?;
    Ok(path)
}

/// `<data_dir>/ipc/<folder>`, validated.
pub fn resolve_group_ipc_path(data_dir: &Path, folder: &str) -> Result<PathBuf, GroupError> {
    assert_valid_group_folder(folder)?;
    let base = data_dir.join("ipc");
    let path = base.join(folder);
    ensure_within_base(&base, &path)?;
    Ok(path)
}

/// Lexically normalize a path: fold `.` and `..` without touching the
/// filesystem. Returns `None` when `..` would climb above the start.
pub fn normalize_lexical(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                out.push(component.as_os_str());
            }
        }
    }
    Some(out)
}

/// Error unless `path` lies inside `base` after lexical normalization.
pub fn ensure_within_base(base: &Path, path: &Path) -> Result<(), GroupError> {
    let escapes = || GroupError::EscapesBase {
        path: path.to_path_buf(),
    };
    let base = normalize_lexical(base).ok_or_else(escapes)?;
    let resolved = normalize_lexical(path).ok_or_else(escapes)?;
    if resolved.starts_with(&base) {
        Ok(())
    } else {
        Err(escapes())
    }
}
