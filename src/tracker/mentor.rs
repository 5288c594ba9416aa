//! Per-call mentor evaluation.
//!
//! Deterministic signal analysis of each completed call. Signals carry a
//! value in `[0, 1]` (0 is bad) and a weight; the verdict comes from the
//! weighted mean. Results are left in state for the hindsight gate.

use super::parse_exit_code;
use crate::hook::ToolCall;
use crate::state::SessionState;
use serde_json::{json, Value};

const TEST_KEYWORDS: &[&str] = &[
    "pytest",
    "test_framework",
    "npm test",
    "cargo test",
    "go test",
    "python -m pytest",
];
const WEAK_VERIFY: &[&str] = &["ls", "echo", "pwd", "cat"];
const STRONG_VERIFY: &[&str] = &["pytest", "test_framework", "cargo test", "npm test"];

const ERROR_LOOP_COUNT: u32 = 3;
const EDIT_CHURN_STREAK: u32 = 5;
const LARGE_EDIT_CHARS: usize = 500;

const TOOL_RATE_SIGMA_THRESHOLD: f64 = 3.0;
const TOOL_DOMINANCE_RATIO: f64 = 0.7;
const BLOCK_RATE_HIGH_THRESHOLD: f64 = 0.5;
const ERROR_RATE_HIGH_THRESHOLD: f64 = 0.3;
const MEMORY_GAP_SECS: f64 = 600.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: String,
    pub value: f64,
    pub weight: f64,
    pub detail: String,
}

impl Signal {
    fn new(name: &str, value: f64, weight: f64, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value,
            weight,
            detail: detail.into(),
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "value": self.value,
            "weight": self.weight,
            "detail": self.detail,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Proceed,
    Advise,
    Warn,
    Escalate,
}

impl Action {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            Self::Proceed
        } else if score >= 0.5 {
            Self::Advise
        } else if score >= 0.3 {
            Self::Warn
        } else {
            Self::Escalate
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Advise => "advise",
            Self::Warn => "warn",
            Self::Escalate => "escalate",
        }
    }

    /// Verdicts the agent is told about
    pub fn is_alarming(&self) -> bool {
        matches!(self, Self::Warn | Self::Escalate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub action: Action,
    pub score: f64,
    pub signals: Vec<Signal>,
    pub message: String,
}

fn eval_bash(call: &ToolCall, response: &Value, state: &SessionState) -> Vec<Signal> {
    if call.tool_name != "Bash" {
        return Vec::new();
    }
    let mut signals = Vec::new();
    let command = call.command();
    let is_test = TEST_KEYWORDS.iter().any(|kw| command.contains(kw));

    if is_test {
        match parse_exit_code(response) {
            Some(0) => signals.push(Signal::new("test_pass", 1.0, 2.0, "Tests passed")),
            Some(code) => signals.push(Signal::new(
                "test_fail",
                0.0,
                2.0,
                format!("Tests failed (exit {})", code),
            )),
            None => {}
        }
    }

    if let Some((pattern, count)) = state
        .error_pattern_counts
        .iter()
        .find(|(_, count)| **count >= ERROR_LOOP_COUNT)
    {
        signals.push(Signal::new(
            "error_loop",
            0.1,
            1.5,
            format!(
                "Same error repeated {}x: {}",
                count,
                crate::hook::truncate_chars(pattern, 60)
            ),
        ));
    }

    if WEAK_VERIFY.iter().any(|kw| command.contains(kw)) {
        signals.push(Signal::new(
            "verification_quality",
            0.1,
            0.5,
            "Weak verification (ls/echo)",
        ));
    } else if STRONG_VERIFY.iter().any(|kw| command.contains(kw)) {
        signals.push(Signal::new(
            "verification_quality",
            1.0,
            0.5,
            "Strong verification (test suite)",
        ));
    } else {
        signals.push(Signal::new(
            "verification_quality",
            0.5,
            0.3,
            "Moderate verification",
        ));
    }
    signals
}

fn eval_edit(call: &ToolCall, state: &SessionState) -> Vec<Signal> {
    if !call.is_edit_tool() {
        return Vec::new();
    }
    let mut signals = Vec::new();
    let file_path = call.target_path();
    if !file_path.is_empty() {
        let streak = state.edit_streak.get(file_path).copied().unwrap_or(0);
        if streak >= EDIT_CHURN_STREAK {
            signals.push(Signal::new(
                "edit_churn",
                0.2,
                1.5,
                format!("File edited {}x without passing test", streak),
            ));
        }
    }

    if call.tool_name == "Edit" {
        let old = call.input_str("old_string");
        let new = call.input_str("new_string");
        if !old.is_empty() && !new.is_empty() && (new.len() as f64) < old.len() as f64 * 0.3 {
            signals.push(Signal::new(
                "possible_revert",
                0.3,
                1.0,
                "Edit removed >70% of content, possible revert",
            ));
        }
        if old.len() > LARGE_EDIT_CHARS {
            signals.push(Signal::new(
                "large_edit",
                0.6,
                0.3,
                format!("Large edit ({} chars replaced)", old.len()),
            ));
        }
    }
    signals
}

fn is_empty_result(response: &Value) -> bool {
    match response {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s.contains("0 matches") || s.starts_with("Error:") || s.starts_with("error:")
        }
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.get("error").is_some_and(|e| match e {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }),
        _ => false,
    }
}

fn eval_search(call: &ToolCall, response: &Value, state: &mut SessionState) -> Vec<Signal> {
    let tool = call.tool_name.as_str();
    if !matches!(tool, "Grep" | "Glob" | "Read") || !is_empty_result(response) {
        state.mentor_empty_search_streak = 0;
        return Vec::new();
    }
    let mut signals = vec![Signal::new(
        "empty_search",
        0.4,
        0.8,
        format!("No results for {}", tool),
    )];
    // Two earlier empties plus this one
    if state.mentor_empty_search_streak >= 2 {
        signals.push(Signal::new(
            "search_stuck",
            0.1,
            1.2,
            "3+ empty search results in a row",
        ));
    }
    state.mentor_empty_search_streak += 1;
    signals
}

fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Session-level behaviour checks: one tool dominating, many blocks,
/// many errors, and long stretches without a memory query
pub fn behavioral_anomalies(state: &SessionState, now: f64) -> Vec<(&'static str, String)> {
    let mut anomalies = Vec::new();
    let total = state.total_tool_calls.max(1) as f64;

    let counts = &state.tool_call_counts;
    if counts.len() >= 2 {
        let values: Vec<f64> = counts.values().map(|c| *c as f64).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let sd = stddev(&values);
        let (tool, max) = counts
            .iter()
            .max_by_key(|(_, c)| **c)
            .map(|(t, c)| (t.as_str(), *c as f64))
            .unwrap_or(("", 0.0));
        let sigma = if sd > 0.0 { (max - mean) / sd } else { 0.0 };
        let sum: f64 = values.iter().sum();
        let ratio = if sum > 0.0 { max / sum } else { 0.0 };

        let mut parts = Vec::new();
        if sd > 0.0 && sigma > TOOL_RATE_SIGMA_THRESHOLD {
            parts.push(format!("{:.1}σ above mean {:.1}", sigma, mean));
        }
        if ratio > TOOL_DOMINANCE_RATIO {
            parts.push(format!("{:.0}% of all calls", ratio * 100.0));
        }
        if !parts.is_empty() {
            anomalies.push((
                "tool_call_burst",
                format!(
                    "Tool '{}' called {} times ({}), possible runaway loop",
                    tool,
                    max as u64,
                    parts.join(", ")
                ),
            ));
        }
    }

    let block_rate = state.gate_block_outcomes.len() as f64 / total;
    if block_rate > BLOCK_RATE_HIGH_THRESHOLD {
        anomalies.push((
            "high_block_rate",
            format!(
                "Gate block rate is {:.1}% of all tool calls (threshold {:.0}%), agent may be stuck in a blocked pattern",
                block_rate * 100.0,
                BLOCK_RATE_HIGH_THRESHOLD * 100.0
            ),
        ));
    }

    let error_rate = state.unlogged_errors.len() as f64 / total;
    if error_rate > ERROR_RATE_HIGH_THRESHOLD {
        anomalies.push((
            "high_error_rate",
            format!(
                "Error rate is {:.1}% of all tool calls (threshold {:.0}%), frequent failures suggest a systemic issue",
                error_rate * 100.0,
                ERROR_RATE_HIGH_THRESHOLD * 100.0
            ),
        ));
    }

    let gap = if state.memory_last_queried > 0.0 {
        now - state.memory_last_queried
    } else {
        (now - state.session_start).max(1.0)
    };
    if gap > MEMORY_GAP_SECS {
        anomalies.push((
            "memory_query_gap",
            format!(
                "No memory query for {:.1} min (threshold {} min), agent may be operating without long-term context",
                gap / 60.0,
                (MEMORY_GAP_SECS / 60.0) as u64
            ),
        ));
    }
    anomalies
}

fn eval_progress(state: &SessionState, now: f64) -> Vec<Signal> {
    if state.tool_call_count % 10 != 0 {
        return Vec::new();
    }
    behavioral_anomalies(state, now)
        .into_iter()
        .map(|(name, detail)| Signal::new(name, 0.2, 1.0, detail))
        .collect()
}

pub fn compute_verdict(signals: Vec<Signal>) -> Verdict {
    let total_weight: f64 = signals.iter().map(|s| s.weight).sum();
    if signals.is_empty() || total_weight == 0.0 {
        return Verdict {
            action: Action::Proceed,
            score: 1.0,
            signals,
            message: String::new(),
        };
    }
    let score = signals.iter().map(|s| s.value * s.weight).sum::<f64>() / total_weight;
    let action = Action::from_score(score);
    let issues: Vec<String> = signals
        .iter()
        .filter(|s| s.value < 0.7)
        .take(3)
        .map(|s| format!("{}={:.1}", s.name, s.value))
        .collect();
    let message = if issues.is_empty() {
        String::new()
    } else {
        format!(
            "Mentor ({}, score={:.2}): {}",
            action.as_str(),
            score,
            issues.join(", ")
        )
    };
    Verdict {
        action,
        score,
        signals,
        message,
    }
}

/// Evaluate a completed call and record the verdict in state
pub fn evaluate(call: &ToolCall, response: &Value, state: &mut SessionState, now: f64) -> Verdict {
    let mut signals = eval_bash(call, response, state);
    signals.extend(eval_edit(call, state));
    signals.extend(eval_search(call, response, state));
    signals.extend(eval_progress(state, now));

    let verdict = compute_verdict(signals);
    state.mentor_last_verdict = verdict.action.as_str().to_string();
    state.mentor_last_score = verdict.score;
    state.mentor_signals = verdict.signals.iter().map(Signal::to_json).collect();
    match verdict.action {
        Action::Escalate => state.mentor_escalation_count += 1,
        Action::Proceed | Action::Advise => state.mentor_escalation_count = 0,
        Action::Warn => {}
    }
    tracing::debug!(
        tool = %call.tool_name,
        action = verdict.action.as_str(),
        score = verdict.score,
        signals = verdict.signals.len(),
        "mentor verdict"
    );
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_thresholds() {
        assert_eq!(Action::from_score(0.7), Action::Proceed);
        assert_eq!(Action::from_score(0.5), Action::Advise);
        assert_eq!(Action::from_score(0.3), Action::Warn);
        assert_eq!(Action::from_score(0.29), Action::Escalate);
    }

    #[test]
    fn test_failing_tests_escalate() {
        let mut state = SessionState::new_at(0.0);
        state.tool_call_count = 1;
        state.error_pattern_counts.insert("FAILED".into(), 3);
        let call = ToolCall::post("Bash", serde_json::json!({"command": "pytest -x"}));
        let verdict = evaluate(&call, &serde_json::json!({"exit_code": 1}), &mut state, 10.0);

        // (0*2 + 0.1*1.5 + 1.0*0.5) / 4.0
        assert!((verdict.score - 0.1625).abs() < 1e-9);
        assert_eq!(verdict.action, Action::Escalate);
        assert_eq!(
            verdict.message,
            "Mentor (escalate, score=0.16): test_fail=0.0, error_loop=0.1"
        );
        assert_eq!(state.mentor_escalation_count, 1);
        assert_eq!(state.mentor_last_verdict, "escalate");
        assert_eq!(state.mentor_signals.len(), 3);
    }

    #[test]
    fn test_passing_tests_reset_escalation() {
        let mut state = SessionState::new_at(0.0);
        state.tool_call_count = 1;
        state.mentor_escalation_count = 2;
        let call = ToolCall::post("Bash", serde_json::json!({"command": "cargo test"}));
        let verdict = evaluate(&call, &serde_json::json!({"exit_code": 0}), &mut state, 10.0);
        assert_eq!(verdict.action, Action::Proceed);
        assert!(verdict.message.is_empty());
        assert_eq!(state.mentor_escalation_count, 0);
    }

    #[test]
    fn test_repeated_empty_searches() {
        let mut state = SessionState::new_at(0.0);
        state.tool_call_count = 1;
        let call = ToolCall::post("Grep", serde_json::json!({"pattern": "nope"}));
        evaluate(&call, &serde_json::json!(""), &mut state, 1.0);
        evaluate(&call, &serde_json::json!("0 matches"), &mut state, 2.0);
        assert_eq!(state.mentor_signals.len(), 1);
        let verdict = evaluate(&call, &serde_json::json!([]), &mut state, 3.0);
        let names: Vec<&str> = verdict.signals.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["empty_search", "search_stuck"]);
        assert_eq!(state.mentor_empty_search_streak, 3);

        evaluate(&call, &serde_json::json!("src/lib.rs:12: fn nope()"), &mut state, 4.0);
        assert_eq!(state.mentor_empty_search_streak, 0);
    }

    #[test]
    fn test_edit_churn_and_revert() {
        let mut state = SessionState::new_at(0.0);
        state.tool_call_count = 1;
        state.edit_streak.insert("/p/a.py".into(), 6);
        let call = ToolCall::post(
            "Edit",
            serde_json::json!({"file_path": "/p/a.py", "old_string": "x".repeat(600), "new_string": "y"}),
        );
        let verdict = evaluate(&call, &Value::Null, &mut state, 1.0);
        let names: Vec<&str> = verdict.signals.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["edit_churn", "possible_revert", "large_edit"]);
        assert_eq!(verdict.action, Action::Escalate);
    }

    #[test]
    fn test_behavioral_anomalies() {
        let mut state = SessionState::new_at(0.0);
        state.tool_call_counts.insert("Bash".into(), 18);
        state.tool_call_counts.insert("Read".into(), 2);
        state.total_tool_calls = 20;
        state.memory_last_queried = 1000.0;
        let found: Vec<&str> = behavioral_anomalies(&state, 1100.0)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(found, vec!["tool_call_burst"]);

        state.memory_last_queried = 0.0;
        let found = behavioral_anomalies(&state, 2000.0);
        assert!(found.iter().any(|(name, detail)| *name == "memory_query_gap"
            && detail.starts_with("No memory query for 33.3 min")));
    }
}
