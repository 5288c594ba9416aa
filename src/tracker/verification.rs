//! Verification scoring and gate block outcome resolution.
//!
//! Every Bash call carries some evidence that pending edits work. Test
//! suites carry the most; `ls` carries almost none. Scores accumulate per
//! file until a file crosses [`VERIFIED_THRESHOLD`].

use crate::config::Paths;
use crate::hook::{basename, file_stem, truncate_chars, ToolCall};
use crate::state::effectiveness::{update_gate_effectiveness, EffectivenessField};
use crate::state::SessionState;
use once_cell::sync::Lazy;
use regex::Regex;

pub const BROAD_TEST_COMMANDS: &[&str] = &[
    "pytest",
    "python -m pytest",
    "npm test",
    "cargo test",
    "go test",
    "make test",
];

pub const VERIFIED_THRESHOLD: f64 = 70.0;

/// Blocks older than this are never matched to a later call
pub const OUTCOME_WINDOW_SECS: f64 = 1800.0;

const SCRIPT_RUNNERS: &[&str] = &["python ", "python3 ", "node ", "ruby ", "bash ", "sh ", "./"];
const GENERIC_COMMANDS: &[&str] = &["ls", "git status", "echo ", "cat ", "pwd", "which "];
const UNVERIFIABLE_PREFIXES: &[&str] = &["/tmp/", "/var/tmp/", "/dev/"];

static TARGETED_PY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\btest_\w+\.py\b").unwrap());
static TARGETED_JS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+\.test\.(js|ts|tsx)\b").unwrap());

/// Confidence that a command exercised the code: 100 for a full suite,
/// 70 for a targeted test, 50 for running a script, 10 for inspection
/// commands and 30 for anything else
pub fn classify_verification_score(command: &str) -> f64 {
    for kw in BROAD_TEST_COMMANDS {
        if let Some(idx) = command.find(kw) {
            let rest = command[idx + kw.len()..].trim();
            if TARGETED_PY.is_match(rest) || rest.contains("::") || TARGETED_JS.is_match(rest) {
                return 70.0;
            }
            return 100.0;
        }
    }
    if SCRIPT_RUNNERS.iter().any(|kw| command.contains(kw)) {
        return 50.0;
    }
    if GENERIC_COMMANDS.iter().any(|kw| command.contains(kw)) {
        return 10.0;
    }
    30.0
}

pub fn is_broad_test_command(command: &str) -> bool {
    BROAD_TEST_COMMANDS.iter().any(|kw| command.contains(kw))
}

/// `needle` appears in `haystack` as a whole word
fn mentions(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    Regex::new(&format!(r"\b{}\b", regex::escape(needle)))
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}

/// Apply a Bash command's evidence to pending files and promote the ones
/// that cross the threshold. Edit streaks restart on any verification.
pub fn score_pending(command: &str, state: &mut SessionState, now: f64) {
    let score = classify_verification_score(command);
    state.edit_streak.clear();

    if is_broad_test_command(command) {
        for fp in &state.pending_verification {
            *state.verification_scores.entry(fp.clone()).or_insert(0.0) += score;
        }
    } else {
        for fp in &state.pending_verification {
            let matched = mentions(command, fp)
                || mentions(command, basename(fp))
                || mentions(command, file_stem(fp));
            if matched {
                // Running the edited file itself counts as targeted verification
                let effective = if score >= 30.0 { score.max(70.0) } else { score };
                *state.verification_scores.entry(fp.clone()).or_insert(0.0) += effective;
            }
        }
    }

    let pending = std::mem::take(&mut state.pending_verification);
    for fp in pending {
        let total = state.verification_scores.get(&fp).copied().unwrap_or(0.0);
        if total < VERIFIED_THRESHOLD {
            state.pending_verification.push(fp);
            continue;
        }
        if !UNVERIFIABLE_PREFIXES.iter().any(|p| fp.starts_with(p)) {
            state.verification_timestamps.insert(fp.clone(), now);
            state.verified_fixes.push(fp.clone());
        }
        state.verification_scores.remove(&fp);
    }
}

/// Match this call against unresolved blocks on the same tool and target.
/// A block followed by a memory or fix-history lookup counts as prevented;
/// otherwise the agent went around it.
pub fn resolve_block_outcomes(call: &ToolCall, state: &mut SessionState, paths: &Paths, now: f64) {
    if state.gate_block_outcomes.is_empty() {
        return;
    }
    let target = match call.target_path() {
        "" => truncate_chars(call.command(), 100),
        path => path,
    };
    if target.is_empty() {
        return;
    }

    let memory_ts = state.memory_last_queried;
    let fix_ts = state.fix_history_queried;
    for outcome in state.gate_block_outcomes.iter_mut() {
        if outcome.resolved_by.is_some()
            || outcome.tool != call.tool_name
            || outcome.file != target
            || now - outcome.timestamp >= OUTCOME_WINDOW_SECS
        {
            continue;
        }
        let (field, label) = if memory_ts > outcome.timestamp || fix_ts > outcome.timestamp {
            (EffectivenessField::Prevented, "prevented")
        } else {
            (EffectivenessField::Overrides, "override")
        };
        if let Err(e) = update_gate_effectiveness(paths, &outcome.gate, field) {
            tracing::debug!(gate = %outcome.gate, error = %e, "effectiveness update failed");
        }
        outcome.resolved_by = Some(label.to_string());
    }

    state
        .gate_block_outcomes
        .retain(|o| o.resolved_by.is_none() || now - o.timestamp < OUTCOME_WINDOW_SECS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::effectiveness::load_gate_effectiveness;
    use crate::state::BlockOutcome;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_classify_verification_score() {
        assert_eq!(classify_verification_score("pytest"), 100.0);
        assert_eq!(classify_verification_score("cargo test --all"), 100.0);
        assert_eq!(classify_verification_score("pytest tests/test_api.py"), 70.0);
        assert_eq!(classify_verification_score("pytest tests/x.py::test_one"), 70.0);
        assert_eq!(classify_verification_score("npm test -- app.test.tsx"), 70.0);
        assert_eq!(classify_verification_score("python3 script.py"), 50.0);
        assert_eq!(classify_verification_score("ls -la"), 10.0);
        assert_eq!(classify_verification_score("git status"), 10.0);
        assert_eq!(classify_verification_score("grep -r foo ."), 30.0);
    }

    #[test]
    fn test_broad_suite_verifies_all_pending() {
        let mut state = SessionState::new_at(0.0);
        state.pending_verification = vec!["/p/a.py".into(), "/tmp/scratch.py".into()];
        state.edit_streak.insert("/p/a.py".into(), 4);
        score_pending("pytest", &mut state, 50.0);

        assert!(state.pending_verification.is_empty());
        assert_eq!(state.verified_fixes, vec!["/p/a.py".to_string()]);
        assert_eq!(state.verification_timestamps["/p/a.py"], 50.0);
        assert!(state.verification_scores.is_empty());
        assert!(state.edit_streak.is_empty());
    }

    #[test]
    fn test_targeted_scores_only_mentioned_files() {
        let mut state = SessionState::new_at(0.0);
        state.pending_verification = vec!["/p/tool.py".into(), "/p/other.py".into()];
        score_pending("python3 /p/tool.py --check", &mut state, 10.0);
        assert_eq!(state.verified_fixes, vec!["/p/tool.py".to_string()]);
        assert_eq!(state.pending_verification, vec!["/p/other.py".to_string()]);

        // Weak evidence accumulates without promoting
        score_pending("cat other.py", &mut state, 11.0);
        assert_eq!(state.verification_scores["/p/other.py"], 10.0);
        assert_eq!(state.pending_verification, vec!["/p/other.py".to_string()]);
    }

    #[test]
    fn test_resolve_block_outcomes() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        std::fs::create_dir_all(&paths.hooks_dir).unwrap();

        let mut state = SessionState::new_at(0.0);
        let block = |gate: &str, file: &str, ts: f64| BlockOutcome {
            gate: gate.into(),
            tool: "Edit".into(),
            file: file.into(),
            timestamp: ts,
            resolved_by: None,
        };
        state.gate_block_outcomes = vec![
            block("gate_01_read_before_edit", "/p/a.py", 1000.0),
            block("gate_04_memory_first", "/p/b.py", 1000.0),
        ];
        state.memory_last_queried = 1010.0;

        let call = ToolCall::post("Edit", json!({"file_path": "/p/a.py"}));
        resolve_block_outcomes(&call, &mut state, &paths, 1020.0);
        assert_eq!(
            state.gate_block_outcomes[0].resolved_by.as_deref(),
            Some("prevented")
        );
        assert!(state.gate_block_outcomes[1].resolved_by.is_none());

        state.memory_last_queried = 0.0;
        let call = ToolCall::post("Edit", json!({"file_path": "/p/b.py"}));
        resolve_block_outcomes(&call, &mut state, &paths, 1030.0);
        assert_eq!(
            state.gate_block_outcomes[1].resolved_by.as_deref(),
            Some("override")
        );

        let table = load_gate_effectiveness(&paths);
        assert_eq!(table["gate_01_read_before_edit"].prevented, 1);
        assert_eq!(table["gate_04_memory_first"].overrides, 1);

        // Resolved entries age out
        let call = ToolCall::post("Read", json!({"file_path": "/x"}));
        resolve_block_outcomes(&call, &mut state, &paths, 1000.0 + OUTCOME_WINDOW_SECS + 1.0);
        assert!(state.gate_block_outcomes.is_empty());
    }
}
