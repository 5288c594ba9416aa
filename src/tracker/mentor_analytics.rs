//! Nudges toward the analytics tools.
//!
//! Editing framework files suggests the matching dashboard, and every
//! fiftieth call suggests a session checkpoint. Each suggestion stays quiet
//! while its tool was used within the cooldown.

use crate::hook::ToolCall;
use crate::state::SessionState;

struct Trigger {
    fragment: &'static str,
    tool: &'static str,
    cooldown_secs: f64,
    label: &'static str,
}

/// First match wins
const TRIGGERS: &[Trigger] = &[
    Trigger { fragment: "/gates/", tool: "gate_dashboard", cooldown_secs: 900.0, label: "gate file" },
    Trigger { fragment: "/skills/", tool: "skill_health", cooldown_secs: 900.0, label: "skill file" },
    Trigger { fragment: "enforcer", tool: "gate_timing", cooldown_secs: 1200.0, label: "enforcer" },
    Trigger { fragment: "tracker", tool: "gate_timing", cooldown_secs: 1200.0, label: "tracker" },
    Trigger { fragment: "/shared/", tool: "gate_timing", cooldown_secs: 1200.0, label: "shared module" },
];

pub const CHECKPOINT_INTERVAL: u64 = 50;
const CHECKPOINT_COOLDOWN_SECS: f64 = 1800.0;

fn used_recently(state: &SessionState, tool: &str, cooldown_secs: f64, now: f64) -> bool {
    state
        .analytics_last_used
        .get(tool)
        .is_some_and(|ts| now - ts < cooldown_secs)
}

pub fn evaluate(call: &ToolCall, state: &SessionState, now: f64) -> Vec<String> {
    let mut nudges = Vec::new();

    if matches!(call.tool_name.as_str(), "Edit" | "Write") {
        let path = call.input_str("file_path");
        if !path.is_empty() {
            if let Some(t) = TRIGGERS.iter().find(|t| path.contains(t.fragment)) {
                if !used_recently(state, t.tool, t.cooldown_secs, now) {
                    nudges.push(format!(
                        "You edited a {}. Run mcp__analytics__{}() to check impact.",
                        t.label, t.tool
                    ));
                }
            }
        }
    }

    let total = state.total_tool_calls;
    if total > 0
        && total % CHECKPOINT_INTERVAL == 0
        && !used_recently(state, "session_summary", CHECKPOINT_COOLDOWN_SECS, now)
    {
        nudges.push(format!(
            "[{} tool calls] Run mcp__analytics__session_summary() for a checkpoint.",
            total
        ));
    }
    nudges
}
