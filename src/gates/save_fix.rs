//! Gate 6: save to memory.
//!
//! Verified fixes have to be saved to memory before work moves on. Everything
//! else this gate notices (unlogged errors, repair loops, churn, pending
//! chains, unsaved plans) is advisory.

use super::{Gate, GateContext, GateId};
use crate::gate_result::{GateResult, Severity};
use crate::hook::{basename, ToolCall};
use crate::state::SessionState;
use anyhow::Result;

pub const BLOCK_THRESHOLD: usize = 2;
pub const STALE_FIX_SECS: f64 = 1200.0;
const PLAN_STALE_SECS: f64 = 1800.0;
const REPAIR_LOOP_COUNT: u32 = 3;
const REPAIR_LOOP_STALE_SECS: f64 = 600.0;
const CHURN_THRESHOLD: u32 = 3;
const READ_ONLY_AGENTS: &[&str] = &["researcher", "Explore"];

pub struct SaveFix;

impl SaveFix {
    /// Drop verified fixes whose verification is older than the stale window
    fn expire_fixes(state: &mut SessionState, now: f64) {
        let timestamps = &state.verification_timestamps;
        state.verified_fixes.retain(|f| {
            let verified_at = timestamps.get(f).copied().unwrap_or(now);
            now - verified_at <= STALE_FIX_SECS
        });
    }

    fn repair_loop(state: &SessionState, now: f64) -> Option<String> {
        state
            .error_pattern_counts
            .iter()
            .filter(|(_, count)| **count >= REPAIR_LOOP_COUNT)
            .find(|(pattern, _)| {
                let stale = state
                    .error_windows
                    .iter()
                    .find(|w| &w.pattern == *pattern)
                    .map(|w| now - w.last_seen > REPAIR_LOOP_STALE_SECS)
                    .unwrap_or(false);
                !stale
            })
            .map(|(pattern, count)| {
                format!(
                    "REPAIR LOOP: Error '{}' has occurred {} times. Consider a different approach instead of retrying the same fix.",
                    pattern, count
                )
            })
    }

    fn advisories(state: &mut SessionState, ctx: &GateContext<'_>) -> Vec<String> {
        let mut notes = Vec::new();

        if let Some(latest) = state.unlogged_errors.last() {
            notes.push(format!(
                "WARNING: {} unlogged error(s) detected (latest: '{}' from `{}`). Consider using remember_this() with outcome:failed,error_pattern:{} tags.",
                state.unlogged_errors.len(),
                latest.pattern,
                latest.command,
                latest.pattern
            ));
        }

        if let Some(note) = Self::repair_loop(state, ctx.now) {
            notes.push(note);
        }

        // First of the highest counts, so ties resolve alphabetically
        let top = state
            .edit_streak
            .iter()
            .fold(None::<(&String, u32)>, |best, (file, count)| match best {
                Some((_, c)) if c >= *count => best,
                _ => Some((file, *count)),
            });
        if let Some((file, count)) = top.filter(|(_, c)| *c >= CHURN_THRESHOLD) {
            notes.push(format!("Top churn: {} ({} edits)", basename(file), count));
        }

        if !state.pending_chain_ids.is_empty() {
            notes.push(format!(
                "WARNING: {} fix attempt(s) without recorded outcome. Call record_outcome() to log whether the fix worked or failed.",
                state.pending_chain_ids.len()
            ));
        }

        if state.last_exit_plan_mode > 0.0 {
            let plan_age = ctx.now - state.last_exit_plan_mode;
            if plan_age > PLAN_STALE_SECS {
                state.last_exit_plan_mode = 0.0;
            } else if state.last_exit_plan_mode > ctx.memory_last_queried(state) {
                notes.push(format!(
                    "WARNING: Plan mode exited without saving plan to memory. Consider using remember_this() to preserve your plan. Plan created {} min ago.",
                    (plan_age / 60.0) as i64
                ));
            }
        }
        notes
    }
}

impl Gate for SaveFix {
    fn id(&self) -> GateId {
        GateId::SaveFix
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || !self.id().watches(&call.tool_name) {
            return Ok(GateResult::pass(name));
        }
        if call.tool_name == "Task" && READ_ONLY_AGENTS.contains(&call.input_str("subagent_type")) {
            return Ok(GateResult::pass(name));
        }

        Self::expire_fixes(state, ctx.now);

        if state.verified_fixes.len() >= BLOCK_THRESHOLD {
            let fixes: Vec<&str> = state.verified_fixes.iter().take(3).map(|f| basename(f)).collect();
            if call.tool_name == "Bash" {
                // Tests still have to run to satisfy gates 5 and 15
                return Ok(GateResult::warn(
                    name,
                    format!(
                        "[{}] WARNING: {} verified fixes unsaved ({}). Bash allowed for test verification. Call remember_this() soon.",
                        name,
                        state.verified_fixes.len(),
                        fixes.join(", ")
                    ),
                ));
            }
            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED: {} verified fixes unsaved ({}). Call remember_this() to continue.",
                    name,
                    state.verified_fixes.len(),
                    fixes.join(", ")
                ),
            )
            .with_severity(Severity::Error));
        }

        let notes = Self::advisories(state, ctx);
        if notes.is_empty() {
            return Ok(GateResult::pass(name));
        }
        let message = notes
            .iter()
            .map(|n| format!("[{}] {}", name, n))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(GateResult::warn(name, message))
    }
}
