//! Locked, atomic persistence for session state and the other hook files.

use super::migrate::{normalize_legacy_shapes, run_migrations};
use super::{now_secs, SessionState, STATE_VERSION};
use crate::config::Paths;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Advisory `flock` held for the lifetime of the value
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Shared lock for readers
    pub fn shared(path: &Path) -> Result<Self> {
        Self::acquire(path, false)
    }

    /// Exclusive lock for writers
    pub fn exclusive(path: &Path) -> Result<Self> {
        Self::acquire(path, true)
    }

    fn acquire(path: &Path, exclusive: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        lock_fd(&file, exclusive)
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock_fd(&self.file);
    }
}

#[cfg(unix)]
fn lock_fd(file: &File, exclusive: bool) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let op = if exclusive {
        libc::LOCK_EX
    } else {
        libc::LOCK_SH
    };
    // SAFETY: the descriptor is owned by `file` and stays open for the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_fd(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn lock_fd(_file: &File, _exclusive: bool) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock_fd(_file: &File) {}

/// Lock file guarding `path`
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Write `bytes` to `{path}.tmp.{pid}` and rename it over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp.{}", std::process::id()));
    let tmp = PathBuf::from(tmp);
    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("Failed to write {}", tmp.display()));
    }
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))
}

/// Pretty-printed JSON, written atomically
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes())
}

/// Parse a JSON file, `None` when missing or unreadable
pub fn read_json(path: &Path) -> Option<Value> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Load a session's state. Missing or corrupt files yield a fresh default.
pub fn load_state(paths: &Paths, session_id: &str) -> SessionState {
    let path = paths.state_file(session_id);
    if !path.exists() {
        return SessionState::default();
    }

    // Fall back to an unlocked read if the lock itself is unavailable
    let _lock = match FileLock::shared(&lock_path_for(&path)) {
        Ok(lock) => Some(lock),
        Err(e) => {
            tracing::debug!(error = %e, "state lock unavailable, reading unlocked");
            None
        }
    };

    match parse_state(&path) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "state file unreadable, using defaults");
            SessionState::default()
        }
    }
}

fn parse_state(path: &Path) -> Result<SessionState> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let raw: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let Value::Object(mut map) = raw else {
        anyhow::bail!("state file {} is not a JSON object", path.display());
    };

    let from_version = run_migrations(&mut map);
    if from_version < u64::from(STATE_VERSION) {
        tracing::info!(from_version, to_version = STATE_VERSION, "migrated session state");
    }
    let mut corrections = normalize_legacy_shapes(&mut map, now_secs());

    let mut state: SessionState = serde_json::from_value(Value::Object(map))
        .with_context(|| format!("Invalid state schema in {}", path.display()))?;
    corrections.extend(state.validate_consistency());
    if !corrections.is_empty() {
        tracing::warn!(corrections = %corrections.join("; "), "state consistency corrections");
    }
    Ok(state)
}

/// Cap and persist a session's state under an exclusive lock
pub fn save_state(paths: &Paths, state: &mut SessionState, session_id: &str) -> Result<()> {
    state.apply_caps();
    state.version = STATE_VERSION;

    let path = paths.state_file(session_id);
    let _lock = FileLock::exclusive(&lock_path_for(&path))?;
    write_json_atomic(&path, state)
}

/// Overwrite a session's state with defaults
pub fn reset_state(paths: &Paths, session_id: &str) -> Result<()> {
    let mut state = SessionState::default();
    save_state(paths, &mut state, session_id)
}

/// Remove every session state file, their locks and the legacy `state.json`.
/// Returns how many files were removed.
pub fn cleanup_all_states(paths: &Paths) -> usize {
    let mut removed = 0;
    for pattern in ["state_*.json", "state_*.json.lock"] {
        let full = paths.hooks_dir.join(pattern);
        let Ok(entries) = glob::glob(&full.to_string_lossy()) else {
            continue;
        };
        for entry in entries.flatten() {
            if fs::remove_file(&entry).is_ok() {
                removed += 1;
            }
        }
    }
    let legacy = paths.legacy_state_file();
    if legacy.exists() && fs::remove_file(&legacy).is_ok() {
        removed += 1;
    }
    removed
}

/// Session ids that have a state file, sorted
pub fn list_sessions(paths: &Paths) -> Vec<String> {
    let full = paths.hooks_dir.join("state_*.json");
    let Ok(entries) = glob::glob(&full.to_string_lossy()) else {
        return Vec::new();
    };
    let mut sessions: Vec<String> = entries
        .flatten()
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?;
            let id = name.strip_prefix("state_")?.strip_suffix(".json")?;
            Some(id.to_string())
        })
        .collect();
    sessions.sort();
    sessions
}
