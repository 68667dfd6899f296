//! Resumable-session-id discovery.
//!
//! The reference agent writes one `.jsonl` history file per session under
//! `<home>/.claude/projects/<dir-key>/`, where `dir-key` is the working
//! directory's absolute path with the leading separator stripped and the
//! remaining separators replaced by `-`. The newest file by mtime belongs to
//! the active session; its basename is the id `claude -r <id>` accepts.

use std::path::Path;
use std::time::SystemTime;

use tracing::debug;

use corral_types::CorralError;

/// Map a working-tree path to its history directory key.
fn dir_key(worktree_path: &Path) -> String {
    worktree_path
        .to_string_lossy()
        .trim_start_matches('/')
        .replace('/', "-")
}

/// Find the agent's most recent session id for a working tree.
///
/// `home` is the user's home directory (injected so tests can point at a
/// scratch tree). Missing or empty history directories both surface as
/// [`CorralError::SessionHistoryMissing`].
pub fn find_session_id(worktree_path: &Path, home: &Path) -> Result<String, CorralError> {
    let session_dir = home
        .join(".claude")
        .join("projects")
        .join(dir_key(worktree_path));

    debug!(dir = %session_dir.display(), "looking for agent session files");

    let entries = std::fs::read_dir(&session_dir).map_err(|_| CorralError::SessionHistoryMissing {
        dir: session_dir.clone(),
    })?;

    let mut newest: Option<(SystemTime, String)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            continue;
        }
        let Ok(mtime) = meta.modified() else { continue };
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
            newest = Some((mtime, stem.to_string()));
        }
    }

    match newest {
        Some((_, id)) => Ok(id),
        None => Err(CorralError::SessionHistoryMissing { dir: session_dir }),
    }
}
