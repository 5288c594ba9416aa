//! Forward migrations over the raw JSON object, run before typing.

use super::STATE_VERSION;
use serde_json::{json, Map, Value};

type Migration = fn(&mut Map<String, Value>);

/// `MIGRATIONS[i]` lifts version `i + 1` to `i + 2`
const MIGRATIONS: &[Migration] = &[migrate_v1_to_v2, migrate_v2_to_v3];

fn insert_missing(state: &mut Map<String, Value>, key: &str, value: Value) {
    state.entry(key.to_string()).or_insert(value);
}

/// Error windows, skill tracking, gate upgrade counters, subagent visibility
fn migrate_v1_to_v2(state: &mut Map<String, Value>) {
    insert_missing(state, "error_windows", json!([]));
    insert_missing(state, "skill_usage", json!({}));
    insert_missing(state, "recent_skills", json!([]));
    insert_missing(state, "gate6_warn_count", json!(0));
    insert_missing(state, "verification_scores", json!({}));
    insert_missing(state, "successful_strategies", json!({}));
    insert_missing(state, "tool_call_counts", json!({}));
    insert_missing(state, "total_tool_calls", json!(0));
    insert_missing(state, "active_subagents", json!([]));
    insert_missing(state, "subagent_total_tokens", json!(0));
    insert_missing(state, "subagent_history", json!([]));
}

/// Causal chain enforcement fields
fn migrate_v2_to_v3(state: &mut Map<String, Value>) {
    insert_missing(state, "recent_test_failure", Value::Null);
    insert_missing(state, "fix_history_queried", json!(0));
    insert_missing(state, "fixing_error", json!(false));
}

/// Bring `state` up to [`STATE_VERSION`]. Returns the version it started at.
pub fn run_migrations(state: &mut Map<String, Value>) -> u64 {
    let start = state.get("_version").and_then(Value::as_u64).unwrap_or(1);
    let mut version = start;
    while version < u64::from(STATE_VERSION) {
        match MIGRATIONS.get((version - 1) as usize) {
            Some(migration) => migration(state),
            None => tracing::warn!(version, "no state migration, skipping"),
        }
        version += 1;
    }
    if start < u64::from(STATE_VERSION) {
        state.insert("_version".to_string(), json!(STATE_VERSION));
    }
    start
}

/// Rewrite shapes older writers used. `active_bans` was once a list of ids.
pub fn normalize_legacy_shapes(state: &mut Map<String, Value>, now: f64) -> Vec<String> {
    let mut corrections = Vec::new();
    if let Some(Value::Array(ids)) = state.get("active_bans") {
        let mut migrated = Map::new();
        for id in ids.iter().filter_map(Value::as_str) {
            migrated.insert(
                id.to_string(),
                json!({"fail_count": 3, "first_failed": now, "last_failed": now}),
            );
        }
        corrections.push(format!(
            "active_bans: migrated {} entries from list to dict",
            migrated.len()
        ));
        state.insert("active_bans".to_string(), Value::Object(migrated));
    }
    if !matches!(state.get("skill_usage"), None | Some(Value::Object(_))) {
        state.insert("skill_usage".to_string(), json!({}));
        corrections.push("skill_usage: reset to empty dict (was not a dict)".to_string());
    }
    corrections
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_migrates_to_current() {
        let mut state = json!({"files_read": []}).as_object().cloned().unwrap();
        let start = run_migrations(&mut state);
        assert_eq!(start, 1);
        assert_eq!(state["_version"], json!(STATE_VERSION));
        assert_eq!(state["error_windows"], json!([]));
        assert_eq!(state["fixing_error"], json!(false));
        assert_eq!(state["recent_test_failure"], Value::Null);
    }

    #[test]
    fn test_migration_keeps_existing_values() {
        let mut state = json!({"_version": 2, "fix_history_queried": 55.0})
            .as_object()
            .cloned()
            .unwrap();
        run_migrations(&mut state);
        assert_eq!(state["fix_history_queried"], json!(55.0));
        assert!(!state.contains_key("error_windows"));
    }

    #[test]
    fn test_current_version_untouched() {
        let mut state = json!({"_version": 3}).as_object().cloned().unwrap();
        assert_eq!(run_migrations(&mut state), 3);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_legacy_ban_list() {
        let mut state = json!({"active_bans": ["s1", "s2", 7]})
            .as_object()
            .cloned()
            .unwrap();
        let corrections = normalize_legacy_shapes(&mut state, 10.0);
        assert_eq!(corrections.len(), 1);
        assert_eq!(state["active_bans"]["s1"]["fail_count"], 3);
        assert_eq!(state["active_bans"]["s2"]["last_failed"], 10.0);
        assert_eq!(state["active_bans"].as_object().unwrap().len(), 2);
    }
}
