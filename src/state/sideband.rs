//! Side files other processes use to report into session state without
//! taking the state lock.

use super::store::{read_json, write_atomic};
use super::SessionState;
use crate::config::Paths;
use anyhow::Result;
use serde_json::{json, Value};
use std::fs;

/// Record a memory query in the shared `.memory_last_queried` file
pub fn write_memory_sideband(paths: &Paths, now: f64) -> Result<()> {
    let body = json!({ "timestamp": now }).to_string();
    write_atomic(&paths.memory_sideband(), body.as_bytes())
}

/// Sideband memory timestamp clamped to `[0, now]`; 0 when unreadable
pub fn read_memory_sideband(paths: &Paths, now: f64) -> f64 {
    read_json(&paths.memory_sideband())
        .and_then(|v| v.get("timestamp").and_then(Value::as_f64))
        .map(|ts| ts.min(now).max(0.0))
        .unwrap_or(0.0)
}

/// Latest memory query seen by either this session or the sideband
pub fn get_memory_last_queried(state: &SessionState, paths: &Paths, now: f64) -> f64 {
    state
        .memory_last_queried
        .max(read_memory_sideband(paths, now))
}

/// Partial state another process left for this session
pub fn read_enforcer_sideband(paths: &Paths, session_id: &str) -> Option<Value> {
    read_json(&paths.enforcer_sideband(session_id)).filter(Value::is_object)
}

pub fn write_enforcer_sideband(paths: &Paths, session_id: &str, partial: &Value) -> Result<()> {
    write_atomic(
        &paths.enforcer_sideband(session_id),
        partial.to_string().as_bytes(),
    )
}

pub fn delete_enforcer_sideband(paths: &Paths, session_id: &str) {
    let _ = fs::remove_file(paths.enforcer_sideband(session_id));
}

/// Overlay sideband keys onto `state`. Private `_` keys are skipped except
/// `_sideband_refreshed`. A key whose value does not fit its state field is
/// dropped on its own so one bad value cannot poison the rest. Returns how
/// many keys were applied.
pub fn merge_enforcer_sideband(
    state: &mut SessionState,
    paths: &Paths,
    session_id: &str,
) -> Result<usize> {
    let Some(Value::Object(partial)) = read_enforcer_sideband(paths, session_id) else {
        return Ok(0);
    };
    let mut merged = serde_json::to_value(&*state)?;
    let mut applied = 0;
    for (key, value) in partial {
        if key.starts_with('_') && key != "_sideband_refreshed" {
            continue;
        }
        let mut candidate = merged.clone();
        if let Some(target) = candidate.as_object_mut() {
            target.insert(key.clone(), value);
        }
        match serde_json::from_value::<SessionState>(candidate.clone()) {
            Ok(_) => {
                merged = candidate;
                applied += 1;
            }
            Err(e) => {
                tracing::warn!(session_id, key = %key, error = %e, "dropping sideband value");
            }
        }
    }
    if applied > 0 {
        *state = serde_json::from_value(merged)?;
    }
    Ok(applied)
}
