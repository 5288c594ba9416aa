//! Causal fix tracking: attempts, outcomes and fix-history lookups reported
//! by the memory server's chain tools.

use super::response_object;
use crate::error_normalizer::{error_signature, fnv1a_hash};
use crate::hook::ToolCall;
use crate::state::{BanRecord, SessionState, StrategySuccess};
use serde_json::Value;

pub const RECORD_ATTEMPT: &str = "mcp__memory__record_attempt";
pub const RECORD_OUTCOME: &str = "mcp__memory__record_outcome";
pub const QUERY_FIX_HISTORY: &str = "mcp__memory__query_fix_history";

/// Fail count at which a strategy is banned outright
pub const BAN_THRESHOLD: u32 = 3;

pub fn handle(call: &ToolCall, response: &Value, state: &mut SessionState, now: f64) {
    match call.tool_name.as_str() {
        RECORD_ATTEMPT => record_attempt(call, state),
        RECORD_OUTCOME => record_outcome(response, state, now),
        QUERY_FIX_HISTORY => query_fix_history(response, state, now),
        _ => {}
    }
}

fn record_attempt(call: &ToolCall, state: &mut SessionState) {
    let error_text = call.input_str("error_text");
    let strategy_id = call.input_str("strategy_id");
    if error_text.is_empty() || strategy_id.is_empty() {
        return;
    }
    let (_, error_hash) = error_signature(error_text);
    let chain_id = format!("{}_{}", error_hash, fnv1a_hash(strategy_id));
    state.current_strategy_id = strategy_id.to_string();
    state.current_error_signature = error_hash;
    if !state.pending_chain_ids.contains(&chain_id) {
        state.pending_chain_ids.push(chain_id);
    }
}

fn record_outcome(response: &Value, state: &mut SessionState, now: f64) {
    let resp = response_object(response);
    let strategy_id = resp
        .get("strategy_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.current_strategy_id.clone());
    let outcome = resp.get("outcome").and_then(Value::as_str).unwrap_or("");
    let banned = resp.get("banned").is_some_and(is_truthy);

    if !strategy_id.is_empty() {
        if outcome == "success" {
            let entry = state
                .successful_strategies
                .entry(strategy_id.clone())
                .or_insert_with(StrategySuccess::default);
            entry.success_count += 1;
            entry.last_success = now;
        }
        if banned || outcome == "failure" {
            let ban = state
                .active_bans
                .entry(strategy_id)
                .or_insert_with(|| BanRecord {
                    fail_count: 0,
                    first_failed: now,
                    last_failed: now,
                });
            ban.fail_count = if banned {
                ban.fail_count.max(BAN_THRESHOLD)
            } else {
                ban.fail_count + 1
            };
            ban.last_failed = now;
        }
    }

    state.pending_chain_ids.clear();
    state.current_strategy_id.clear();
}

/// Strategies the server reports as banned are banned here too
fn query_fix_history(response: &Value, state: &mut SessionState, now: f64) {
    state.fix_history_queried = now;
    let resp = response_object(response);
    let Some(banned) = resp.get("banned").and_then(Value::as_array) else {
        return;
    };
    for entry in banned {
        let Some(sid) = entry.get("strategy_id").and_then(Value::as_str) else {
            continue;
        };
        if !sid.is_empty() && !state.active_bans.contains_key(sid) {
            state.active_bans.insert(
                sid.to_string(),
                BanRecord {
                    fail_count: BAN_THRESHOLD,
                    first_failed: now,
                    last_failed: now,
                },
            );
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attempt(state: &mut SessionState, strategy: &str) {
        let call = ToolCall::post(
            RECORD_ATTEMPT,
            json!({"error_text": "KeyError: 'user_id' at line 42", "strategy_id": strategy}),
        );
        handle(&call, &Value::Null, state, 10.0);
    }

    #[test]
    fn test_record_attempt_sets_chain() {
        let mut state = SessionState::new_at(0.0);
        attempt(&mut state, "add-default");
        attempt(&mut state, "add-default");
        assert_eq!(state.current_strategy_id, "add-default");
        assert_eq!(state.current_error_signature.len(), 8);
        assert_eq!(state.pending_chain_ids.len(), 1);
        assert!(state.pending_chain_ids[0].starts_with(&state.current_error_signature));
    }

    #[test]
    fn test_record_outcome_failure_and_ban() {
        let mut state = SessionState::new_at(0.0);
        attempt(&mut state, "retry-loop");
        let call = ToolCall::post(RECORD_OUTCOME, json!({}));
        handle(&call, &json!({"outcome": "failure"}), &mut state, 20.0);
        assert_eq!(state.active_bans["retry-loop"].fail_count, 1);
        assert!(state.pending_chain_ids.is_empty());
        assert!(state.current_strategy_id.is_empty());

        // JSON string responses are accepted too
        let resp = json!(r#"{"strategy_id": "retry-loop", "outcome": "failure", "banned": true}"#);
        handle(&call, &resp, &mut state, 30.0);
        assert_eq!(state.active_bans["retry-loop"].fail_count, BAN_THRESHOLD);
        assert_eq!(state.active_bans["retry-loop"].first_failed, 20.0);
        assert_eq!(state.active_bans["retry-loop"].last_failed, 30.0);
    }

    #[test]
    fn test_record_outcome_success() {
        let mut state = SessionState::new_at(0.0);
        let call = ToolCall::post(RECORD_OUTCOME, json!({}));
        handle(&call, &json!({"strategy_id": "s1", "outcome": "success"}), &mut state, 5.0);
        handle(&call, &json!({"strategy_id": "s1", "outcome": "success"}), &mut state, 6.0);
        assert_eq!(state.successful_strategies["s1"].success_count, 2);
        assert_eq!(state.successful_strategies["s1"].last_success, 6.0);
        assert!(state.active_bans.is_empty());
    }

    #[test]
    fn test_query_fix_history_imports_bans() {
        let mut state = SessionState::new_at(0.0);
        let call = ToolCall::post(QUERY_FIX_HISTORY, json!({"error_text": "x"}));
        let resp = json!({"banned": [{"strategy_id": "bad"}, {"other": 1}, "junk"]});
        handle(&call, &resp, &mut state, 40.0);
        assert_eq!(state.fix_history_queried, 40.0);
        assert_eq!(state.active_bans.len(), 1);
        assert_eq!(state.active_bans["bad"].fail_count, BAN_THRESHOLD);
    }
}
