//! Gate 18: canary monitor.
//!
//! Records every call and surfaces anomalies: first use of a tool, call
//! bursts against the five minute baseline, and the same call repeated
//! back to back. Never blocks. One telemetry line per call goes to the
//! canary log.

use super::{Gate, GateContext, GateId};
use crate::gate_result::GateResult;
use crate::hook::ToolCall;
use crate::state::SessionState;
use anyhow::Result;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

const BURST_WINDOW: f64 = 60.0;
const BASELINE_WINDOW: f64 = 300.0;
const BURST_MULTIPLIER: f64 = 3.0;
const BURST_MIN_CALLS: u64 = 5;
const REPEAT_THRESHOLD: usize = 5;

/// 32-bit FNV-1a of the input's canonical JSON, as 8 hex chars
fn input_fingerprint(input: &Value) -> String {
    let raw = input.to_string();
    let hash = raw.bytes().fold(2_166_136_261u32, |h, b| {
        (h ^ b as u32).wrapping_mul(16_777_619)
    });
    format!("{:08x}", hash)
}

/// Calls per minute within the trailing `window` seconds
fn calls_per_minute(timestamps: &[f64], window: f64, now: f64) -> f64 {
    let recent = timestamps.iter().filter(|t| **t >= now - window).count();
    recent as f64 / (window / 60.0).max(1e-6)
}

fn append_telemetry(path: &Path, record: &Value) {
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", record));
    if let Err(e) = written {
        tracing::debug!(path = %path.display(), error = %e, "canary telemetry write failed");
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub struct Canary;

impl Gate for Canary {
    fn id(&self) -> GateId {
        GateId::Canary
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        let now = ctx.now;
        let tool = call.tool_name.as_str();
        let input = Value::Object(call.tool_input.clone());

        *state.canary_tool_counts.entry(tool.to_string()).or_insert(0) += 1;
        let is_new_tool = !state.canary_seen_tools.iter().any(|t| t == tool);
        if is_new_tool {
            state.canary_seen_tools.push(tool.to_string());
            state.canary_seen_tools.sort();
        }
        state.canary_total_calls += 1;
        let total_calls = state.canary_total_calls;

        // Welford running mean and M2 of the serialized input size
        let size = input.to_string().len() as f64;
        state.canary_size_count += 1;
        let delta = size - state.canary_size_mean;
        state.canary_size_mean += delta / state.canary_size_count as f64;
        state.canary_size_m2 += delta * (size - state.canary_size_mean);

        state.canary_short_timestamps.push(now);
        state.canary_long_timestamps.push(now);
        state
            .canary_short_timestamps
            .retain(|t| *t >= now - BURST_WINDOW * 2.0);
        state
            .canary_long_timestamps
            .retain(|t| *t >= now - BASELINE_WINDOW * 2.0);

        state
            .canary_recent_seq
            .push(format!("{}:{}", tool, input_fingerprint(&input)));
        let excess = state
            .canary_recent_seq
            .len()
            .saturating_sub(REPEAT_THRESHOLD + 1);
        state.canary_recent_seq.drain(..excess);

        let unique_tools = state.canary_seen_tools.len();
        let current_rate = calls_per_minute(&state.canary_short_timestamps, BURST_WINDOW, now);
        let baseline_rate = calls_per_minute(&state.canary_long_timestamps, BASELINE_WINDOW, now);

        let mut anomalies = Vec::new();
        if is_new_tool && total_calls > 1 {
            anomalies.push(format!(
                "new tool observed: '{}' (unique tools seen: {})",
                tool, unique_tools
            ));
        }
        if total_calls >= BURST_MIN_CALLS
            && baseline_rate > 0.0
            && current_rate >= baseline_rate * BURST_MULTIPLIER
        {
            anomalies.push(format!(
                "tool call burst: {:.1} calls/min (baseline {:.1}, {:.0}× threshold)",
                current_rate, baseline_rate, BURST_MULTIPLIER
            ));
        }
        let seq = &state.canary_recent_seq;
        if seq.len() >= REPEAT_THRESHOLD {
            let tail = &seq[seq.len() - REPEAT_THRESHOLD..];
            if tail.iter().all(|entry| *entry == tail[0]) {
                anomalies.push(format!(
                    "repeated identical call: '{}' called {}+ times in a row with the same input",
                    tool, REPEAT_THRESHOLD
                ));
            }
        }

        append_telemetry(
            &ctx.paths.canary_log(),
            &json!({
                "ts": now,
                "tool": tool,
                "event_type": if call.is_pre() { "PreToolUse" } else { "PostToolUse" },
                "input_size": size as u64,
                "total_calls": total_calls,
                "unique_tools": unique_tools,
                "avg_input_size": round_to(state.canary_size_mean, 1),
                "rate_per_min": round_to(current_rate, 2),
                "baseline_rate_per_min": round_to(baseline_rate, 2),
                "anomalies": anomalies,
            }),
        );

        if anomalies.is_empty() {
            return Ok(GateResult::pass(name));
        }
        for anomaly in &anomalies {
            tracing::warn!(gate = name, "{}", anomaly);
        }
        Ok(GateResult::warn(
            name,
            format!("[{}] Anomalies detected: {}", name, anomalies.join("; ")),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::test_support::Fixture;

    #[test]
    fn test_new_tool_and_stats() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        let first = Canary
            .check(&ToolCall::pre("Read", json!({"file_path": "/a"})), &mut state, &fx.ctx(100.0))
            .unwrap();
        assert!(first.message.is_empty());

        let second = Canary
            .check(&ToolCall::pre("Grep", json!({"pattern": "x"})), &mut state, &fx.ctx(101.0))
            .unwrap();
        assert!(!second.blocked);
        assert!(second.message.contains("new tool observed: 'Grep' (unique tools seen: 2)"));
        assert_eq!(state.canary_total_calls, 2);
        assert_eq!(state.canary_seen_tools, vec!["Grep", "Read"]);
        assert_eq!(state.canary_size_count, 2);

        let log = std::fs::read_to_string(fx.paths.canary_log()).unwrap();
        assert_eq!(log.lines().count(), 2);
        let last: Value = serde_json::from_str(log.lines().last().unwrap()).unwrap();
        assert_eq!(last["tool"], "Grep");
    }

    #[test]
    fn test_repeated_identical_calls() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        let call = ToolCall::pre("Bash", json!({"command": "ls"}));
        let mut last = GateResult::pass("x");
        for i in 0..5 {
            last = Canary.check(&call, &mut state, &fx.ctx(1000.0 + i as f64 * 30.0)).unwrap();
        }
        assert!(!last.blocked);
        assert!(last.message.contains("repeated identical call: 'Bash' called 5+ times"));
        assert_eq!(state.canary_recent_seq.len(), 5);
    }

    #[test]
    fn test_burst_against_baseline() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        // A quiet baseline spread across five minutes, then a tight cluster
        state.canary_total_calls = 10;
        state.canary_long_timestamps = vec![700.0, 760.0];
        state.canary_short_timestamps = Vec::new();
        let mut result = GateResult::pass("x");
        for i in 0..6 {
            let call = ToolCall::pre("Read", json!({"file_path": format!("/f{}", i)}));
            result = Canary.check(&call, &mut state, &fx.ctx(1000.0 + i as f64)).unwrap();
        }
        assert!(result.message.contains("tool call burst"));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(
            input_fingerprint(&json!({"a": 1, "b": 2})),
            input_fingerprint(&json!({"b": 2, "a": 1}))
        );
        assert_eq!(input_fingerprint(&json!({})).len(), 8);
    }
}
