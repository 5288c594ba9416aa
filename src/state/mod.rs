//! Per-session gate state.
//!
//! Every session (the main agent and each subagent) owns one JSON file in the
//! hooks directory. Gates read it during PreToolUse; the tracker feeds it
//! during PostToolUse. Keys this crate does not know about are carried in
//! [`SessionState::extra`] and written back untouched.

pub mod claims;
pub mod effectiveness;
pub mod migrate;
pub mod sideband;
pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

pub use store::{cleanup_all_states, list_sessions, load_state, reset_state, save_state};

/// Current on-disk schema version
pub const STATE_VERSION: u32 = 3;

pub const MAX_FILES_READ: usize = 200;
pub const MAX_FILES_EDITED: usize = 200;
pub const MAX_VERIFIED_FIXES: usize = 100;
pub const MAX_PENDING_VERIFICATION: usize = 50;
pub const MAX_UNLOGGED_ERRORS: usize = 20;
pub const MAX_ERROR_PATTERNS: usize = 50;
pub const MAX_ACTIVE_BANS: usize = 50;
pub const MAX_PENDING_CHAINS: usize = 10;
pub const MAX_EDIT_STREAK: usize = 50;
pub const MAX_GATE_BLOCK_OUTCOMES: usize = 100;
pub const MAX_GATE_TIMING_STATS: usize = 20;
pub const MAX_ERROR_WINDOWS: usize = 50;
pub const MAX_RECENT_SKILLS: usize = 50;
pub const MAX_CANARY_TIMESTAMPS: usize = 600;
pub const MAX_CANARY_SEQ: usize = 10;

/// Keys left behind by older schemas
const ORPHANED_KEYS: &[&str] = &["edits_locked", "confidence_warnings", "gate12_warn_count"];

/// Seconds since the Unix epoch
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestFailure {
    pub pattern: String,
    pub timestamp: f64,
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnloggedError {
    pub pattern: String,
    pub command: String,
    pub timestamp: f64,
}

/// Repeated occurrences of one error pattern, deduplicated within a short window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorWindow {
    pub pattern: String,
    pub first_seen: f64,
    pub last_seen: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanRecord {
    pub fail_count: u32,
    pub first_failed: f64,
    pub last_failed: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySuccess {
    pub success_count: u32,
    pub last_success: f64,
}

/// A strategy parked after exhausting its retry budget
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredItem {
    pub strategy: String,
    pub error_signature: String,
    pub fail_count: u32,
    pub file: String,
    pub deferred_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolStat {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingStat {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Default for TimingStat {
    fn default() -> Self {
        Self {
            count: 0,
            total_ms: 0.0,
            min_ms: 999_999.0,
            max_ms: 0.0,
        }
    }
}

impl TimingStat {
    pub fn record(&mut self, elapsed_ms: f64) {
        self.count += 1;
        self.total_ms += elapsed_ms;
        self.min_ms = self.min_ms.min(elapsed_ms);
        self.max_ms = self.max_ms.max(elapsed_ms);
    }
}

/// A block awaiting resolution by a later tool call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockOutcome {
    pub gate: String,
    pub tool: String,
    pub file: String,
    pub timestamp: f64,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillUse {
    pub name: String,
    pub timestamp: f64,
}

/// Typed view over `state_{session}.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    #[serde(rename = "_version")]
    pub version: u32,
    #[serde(rename = "_session_id", skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(rename = "_sideband_refreshed", skip_serializing_if = "std::ops::Not::not")]
    pub sideband_refreshed: bool,
    pub session_start: f64,

    // Reads and edits
    pub files_read: Vec<String>,
    pub files_edited: Vec<String>,
    pub pending_verification: Vec<String>,
    pub verified_fixes: Vec<String>,
    pub verification_scores: BTreeMap<String, f64>,
    pub verification_timestamps: BTreeMap<String, f64>,
    pub edit_streak: BTreeMap<String, u32>,

    // Memory
    pub memory_last_queried: f64,
    pub auto_remember_count: u32,

    // Testing
    pub last_test_run: f64,
    pub last_test_exit_code: Option<i64>,
    pub last_test_command: String,
    pub session_test_baseline: bool,
    pub recent_test_failure: Option<TestFailure>,
    pub fixing_error: bool,
    pub fix_history_queried: f64,

    // Errors
    pub unlogged_errors: Vec<UnloggedError>,
    pub error_pattern_counts: BTreeMap<String, u32>,
    pub error_windows: Vec<ErrorWindow>,

    // Causal chain
    pub pending_chain_ids: Vec<String>,
    pub current_strategy_id: String,
    pub current_error_signature: String,
    pub active_bans: BTreeMap<String, BanRecord>,
    pub successful_strategies: BTreeMap<String, StrategySuccess>,
    pub deferred_items: Vec<DeferredItem>,

    // Counters
    pub tool_call_count: u64,
    pub tool_call_counts: BTreeMap<String, u64>,
    pub total_tool_calls: u64,
    pub tool_stats: BTreeMap<String, ToolStat>,
    pub session_token_estimate: u64,
    pub rate_window_timestamps: Vec<f64>,

    // Gate bookkeeping
    pub gate6_warn_count: u32,
    pub gate4_exemptions: BTreeMap<String, u32>,
    pub model_agent_usage: BTreeMap<String, u32>,
    pub code_quality_warnings_per_file: BTreeMap<String, u32>,
    pub confidence_warnings_per_file: BTreeMap<String, u32>,
    pub confidence_warned_signals: Vec<String>,
    pub gate_timing_stats: BTreeMap<String, TimingStat>,
    pub gate_block_counts: BTreeMap<String, u64>,
    pub gate_block_outcomes: Vec<BlockOutcome>,
    pub gate_effectiveness: Map<String, Value>,
    pub gate_tune_overrides: BTreeMap<String, Map<String, Value>>,
    pub security_profile: String,
    pub injection_attempts: u32,
    pub budget_tier: String,

    // Subagents
    pub active_subagents: Vec<Value>,
    pub subagent_total_tokens: u64,
    pub subagent_history: Vec<Value>,

    // Skills and plan mode
    pub skill_usage: BTreeMap<String, u32>,
    pub recent_skills: Vec<SkillUse>,
    pub last_exit_plan_mode: f64,
    pub session_duration_nudge_hour: u32,

    // Mentor
    pub mentor_last_verdict: String,
    pub mentor_last_score: f64,
    pub mentor_escalation_count: u32,
    pub mentor_signals: Vec<Value>,
    pub mentor_empty_search_streak: u32,
    pub mentor_warned_this_cycle: bool,
    pub mentor_chain_pattern: String,
    pub mentor_chain_score: f64,
    pub mentor_memory_match: Option<Value>,
    pub mentor_historical_context: String,
    pub active_domain: String,

    // Analytics
    pub analytics_last_used: BTreeMap<String, f64>,
    pub analytics_last_queried: f64,
    pub analytics_warn_count: u32,

    // Canary
    pub canary_tool_counts: BTreeMap<String, u64>,
    pub canary_seen_tools: Vec<String>,
    pub canary_total_calls: u64,
    pub canary_size_count: u64,
    pub canary_size_mean: f64,
    pub canary_size_m2: f64,
    pub canary_short_timestamps: Vec<f64>,
    pub canary_long_timestamps: Vec<f64>,
    pub canary_recent_seq: Vec<String>,

    /// Keys written by other tools; preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new_at(now_secs())
    }
}

impl SessionState {
    /// Fresh state for a session starting at `now`
    pub fn new_at(now: f64) -> Self {
        Self {
            version: STATE_VERSION,
            session_id: String::new(),
            sideband_refreshed: false,
            session_start: now,
            files_read: Vec::new(),
            files_edited: Vec::new(),
            pending_verification: Vec::new(),
            verified_fixes: Vec::new(),
            verification_scores: BTreeMap::new(),
            verification_timestamps: BTreeMap::new(),
            edit_streak: BTreeMap::new(),
            memory_last_queried: 0.0,
            auto_remember_count: 0,
            last_test_run: 0.0,
            last_test_exit_code: None,
            last_test_command: String::new(),
            session_test_baseline: false,
            recent_test_failure: None,
            fixing_error: false,
            fix_history_queried: 0.0,
            unlogged_errors: Vec::new(),
            error_pattern_counts: BTreeMap::new(),
            error_windows: Vec::new(),
            pending_chain_ids: Vec::new(),
            current_strategy_id: String::new(),
            current_error_signature: String::new(),
            active_bans: BTreeMap::new(),
            successful_strategies: BTreeMap::new(),
            deferred_items: Vec::new(),
            tool_call_count: 0,
            tool_call_counts: BTreeMap::new(),
            total_tool_calls: 0,
            tool_stats: BTreeMap::new(),
            session_token_estimate: 0,
            rate_window_timestamps: Vec::new(),
            gate6_warn_count: 0,
            gate4_exemptions: BTreeMap::new(),
            model_agent_usage: BTreeMap::new(),
            code_quality_warnings_per_file: BTreeMap::new(),
            confidence_warnings_per_file: BTreeMap::new(),
            confidence_warned_signals: Vec::new(),
            gate_timing_stats: BTreeMap::new(),
            gate_block_counts: BTreeMap::new(),
            gate_block_outcomes: Vec::new(),
            gate_effectiveness: Map::new(),
            gate_tune_overrides: BTreeMap::new(),
            security_profile: "balanced".to_string(),
            injection_attempts: 0,
            budget_tier: String::new(),
            active_subagents: Vec::new(),
            subagent_total_tokens: 0,
            subagent_history: Vec::new(),
            skill_usage: BTreeMap::new(),
            recent_skills: Vec::new(),
            last_exit_plan_mode: 0.0,
            session_duration_nudge_hour: 0,
            mentor_last_verdict: "proceed".to_string(),
            mentor_last_score: 1.0,
            mentor_escalation_count: 0,
            mentor_signals: Vec::new(),
            mentor_empty_search_streak: 0,
            mentor_warned_this_cycle: false,
            mentor_chain_pattern: String::new(),
            mentor_chain_score: 1.0,
            mentor_memory_match: None,
            mentor_historical_context: String::new(),
            active_domain: String::new(),
            analytics_last_used: BTreeMap::new(),
            analytics_last_queried: 0.0,
            analytics_warn_count: 0,
            canary_tool_counts: BTreeMap::new(),
            canary_seen_tools: Vec::new(),
            canary_total_calls: 0,
            canary_size_count: 0,
            canary_size_mean: 0.0,
            canary_size_m2: 0.0,
            canary_short_timestamps: Vec::new(),
            canary_long_timestamps: Vec::new(),
            canary_recent_seq: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Numeric tuning override written by the auto-tuner, e.g.
    /// `gate_tune_overrides.gate_05_proof_before_fixed.block_threshold`
    pub fn tune_override(&self, gate_module: &str, param: &str) -> Option<f64> {
        self.gate_tune_overrides
            .get(gate_module)?
            .get(param)?
            .as_f64()
    }

    /// Session id recorded in the state, "main" when unset
    pub fn session_id_or_main(&self) -> &str {
        if self.session_id.is_empty() {
            "main"
        } else {
            &self.session_id
        }
    }

    /// Dedupe, reconcile and cap after a load. Returns a description of each
    /// correction made.
    pub fn validate_consistency(&mut self) -> Vec<String> {
        let mut corrections = Vec::new();

        dedupe(&mut self.files_read, "files_read", &mut corrections);
        dedupe(
            &mut self.pending_verification,
            "pending_verification",
            &mut corrections,
        );
        dedupe(&mut self.verified_fixes, "verified_fixes", &mut corrections);
        dedupe(&mut self.unlogged_errors, "unlogged_errors", &mut corrections);
        dedupe(
            &mut self.pending_chain_ids,
            "pending_chain_ids",
            &mut corrections,
        );
        dedupe(&mut self.error_windows, "error_windows", &mut corrections);
        dedupe(&mut self.recent_skills, "recent_skills", &mut corrections);

        let verified: HashSet<&String> = self.verified_fixes.iter().collect();
        let before = self.pending_verification.len();
        self.pending_verification.retain(|p| !verified.contains(p));
        let overlap = before - self.pending_verification.len();
        if overlap > 0 {
            corrections.push(format!(
                "pending_verification: removed {} items already in verified_fixes",
                overlap
            ));
        }

        for key in ORPHANED_KEYS {
            if self.extra.remove(*key).is_some() {
                corrections.push(format!("{}: removed (orphaned)", key));
            }
        }

        corrections.extend(self.apply_caps());
        corrections
    }

    /// Enforce every size cap, keeping the newest entries of lists and the
    /// largest entries of counter maps.
    pub fn apply_caps(&mut self) -> Vec<String> {
        let mut corrections = Vec::new();
        cap_tail(&mut self.files_read, MAX_FILES_READ, "files_read", &mut corrections);
        cap_tail(
            &mut self.files_edited,
            MAX_FILES_EDITED,
            "files_edited",
            &mut corrections,
        );
        cap_tail(
            &mut self.verified_fixes,
            MAX_VERIFIED_FIXES,
            "verified_fixes",
            &mut corrections,
        );
        cap_tail(
            &mut self.pending_verification,
            MAX_PENDING_VERIFICATION,
            "pending_verification",
            &mut corrections,
        );
        cap_tail(
            &mut self.unlogged_errors,
            MAX_UNLOGGED_ERRORS,
            "unlogged_errors",
            &mut corrections,
        );
        cap_tail(
            &mut self.pending_chain_ids,
            MAX_PENDING_CHAINS,
            "pending_chain_ids",
            &mut corrections,
        );
        cap_tail(
            &mut self.gate_block_outcomes,
            MAX_GATE_BLOCK_OUTCOMES,
            "gate_block_outcomes",
            &mut corrections,
        );
        cap_tail(
            &mut self.error_windows,
            MAX_ERROR_WINDOWS,
            "error_windows",
            &mut corrections,
        );
        cap_tail(
            &mut self.recent_skills,
            MAX_RECENT_SKILLS,
            "recent_skills",
            &mut corrections,
        );
        cap_tail(
            &mut self.canary_short_timestamps,
            MAX_CANARY_TIMESTAMPS,
            "canary_short_timestamps",
            &mut corrections,
        );
        cap_tail(
            &mut self.canary_long_timestamps,
            MAX_CANARY_TIMESTAMPS,
            "canary_long_timestamps",
            &mut corrections,
        );
        cap_tail(
            &mut self.canary_recent_seq,
            MAX_CANARY_SEQ,
            "canary_recent_seq",
            &mut corrections,
        );

        if self.active_bans.len() > MAX_ACTIVE_BANS {
            let mut by_age: Vec<(String, f64)> = self
                .active_bans
                .iter()
                .map(|(k, v)| (k.clone(), v.last_failed))
                .collect();
            by_age.sort_by(|a, b| a.1.total_cmp(&b.1));
            let excess = self.active_bans.len() - MAX_ACTIVE_BANS;
            for (key, _) in by_age.into_iter().take(excess) {
                self.active_bans.remove(&key);
            }
            corrections.push(format!("active_bans: trimmed to {}", MAX_ACTIVE_BANS));
        }

        keep_top(
            &mut self.error_pattern_counts,
            MAX_ERROR_PATTERNS,
            |v| f64::from(*v),
            "error_pattern_counts",
            &mut corrections,
        );
        keep_top(
            &mut self.edit_streak,
            MAX_EDIT_STREAK,
            |v| f64::from(*v),
            "edit_streak",
            &mut corrections,
        );
        keep_top(
            &mut self.gate_timing_stats,
            MAX_GATE_TIMING_STATS,
            |v| v.count as f64,
            "gate_timing_stats",
            &mut corrections,
        );
        corrections
    }
}

fn dedupe<T: PartialEq + Clone>(list: &mut Vec<T>, key: &str, corrections: &mut Vec<String>) {
    let mut seen: Vec<T> = Vec::with_capacity(list.len());
    for item in list.iter() {
        if !seen.contains(item) {
            seen.push(item.clone());
        }
    }
    if seen.len() < list.len() {
        corrections.push(format!(
            "{}: removed {} duplicates",
            key,
            list.len() - seen.len()
        ));
        *list = seen;
    }
}

fn cap_tail<T>(list: &mut Vec<T>, max: usize, key: &str, corrections: &mut Vec<String>) {
    if list.len() > max {
        corrections.push(format!("{}: capped from {} to {}", key, list.len(), max));
        let excess = list.len() - max;
        list.drain(..excess);
    }
}

fn keep_top<V>(
    map: &mut BTreeMap<String, V>,
    max: usize,
    weight: impl Fn(&V) -> f64,
    key: &str,
    corrections: &mut Vec<String>,
) {
    if map.len() <= max {
        return;
    }
    let before = map.len();
    let mut ranked: Vec<(String, f64)> = map.iter().map(|(k, v)| (k.clone(), weight(v))).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let keep: HashSet<String> = ranked.into_iter().take(max).map(|(k, _)| k).collect();
    map.retain(|k, _| keep.contains(k));
    corrections.push(format!("{}: trimmed from {} to {}", key, before, max));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let state = SessionState::new_at(100.0);
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.session_start, 100.0);
        assert_eq!(state.security_profile, "balanced");
        assert_eq!(state.mentor_last_verdict, "proceed");
        assert_eq!(state.mentor_chain_score, 1.0);
        assert!(state.recent_test_failure.is_none());
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let raw = json!({
            "_version": 3,
            "files_read": ["/a.py"],
            "custom_dashboard_key": {"x": 1},
        });
        let state: SessionState = serde_json::from_value(raw).unwrap();
        assert_eq!(state.files_read, vec!["/a.py".to_string()]);
        assert_eq!(state.extra["custom_dashboard_key"], json!({"x": 1}));

        let back = serde_json::to_value(&state).unwrap();
        assert_eq!(back["custom_dashboard_key"]["x"], 1);
        assert_eq!(back["recent_test_failure"], Value::Null);
        assert!(back.get("_session_id").is_none());
    }

    #[test]
    fn test_consistency_dedupes_and_reconciles() {
        let mut state = SessionState::new_at(0.0);
        state.files_read = vec!["/a".into(), "/b".into(), "/a".into()];
        state.pending_verification = vec!["/x".into(), "/y".into()];
        state.verified_fixes = vec!["/y".into()];
        state.extra.insert("edits_locked".into(), json!(true));

        let corrections = state.validate_consistency();
        assert_eq!(state.files_read, vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(state.pending_verification, vec!["/x".to_string()]);
        assert!(!state.extra.contains_key("edits_locked"));
        assert_eq!(corrections.len(), 3);
    }

    #[test]
    fn test_caps_keep_newest_and_largest() {
        let mut state = SessionState::new_at(0.0);
        state.files_read = (0..250).map(|i| format!("/f{}", i)).collect();
        for i in 0..60u32 {
            state.error_pattern_counts.insert(format!("p{}", i), i);
            state.active_bans.insert(
                format!("s{}", i),
                BanRecord {
                    fail_count: 3,
                    first_failed: 0.0,
                    last_failed: f64::from(i),
                },
            );
        }
        state.apply_caps();

        assert_eq!(state.files_read.len(), MAX_FILES_READ);
        assert_eq!(state.files_read[0], "/f50");
        assert_eq!(state.error_pattern_counts.len(), MAX_ERROR_PATTERNS);
        assert!(!state.error_pattern_counts.contains_key("p0"));
        assert!(state.error_pattern_counts.contains_key("p59"));
        assert_eq!(state.active_bans.len(), MAX_ACTIVE_BANS);
        assert!(!state.active_bans.contains_key("s9"));
        assert!(state.active_bans.contains_key("s10"));
    }

    #[test]
    fn test_timing_stat_record() {
        let mut stat = TimingStat::default();
        stat.record(5.0);
        stat.record(2.0);
        assert_eq!(stat.count, 2);
        assert_eq!(stat.min_ms, 2.0);
        assert_eq!(stat.max_ms, 5.0);
        assert_eq!(stat.total_ms, 7.0);
    }

    #[test]
    fn test_tune_override() {
        let mut state = SessionState::new_at(0.0);
        let mut params = Map::new();
        params.insert("block_threshold".into(), json!(4));
        state
            .gate_tune_overrides
            .insert("gate_05_proof_before_fixed".into(), params);
        assert_eq!(
            state.tune_override("gate_05_proof_before_fixed", "block_threshold"),
            Some(4.0)
        );
        assert_eq!(state.tune_override("gate_05_proof_before_fixed", "x"), None);
    }
}
