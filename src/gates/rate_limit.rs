//! Gate 11: rate limit.
//!
//! Rolling two-minute window of call timestamps. Runs last in the registry,
//! so calls already blocked by another gate are never counted.

use super::{Gate, GateContext, GateId};
use crate::gate_result::GateResult;
use crate::hook::ToolCall;
use crate::state::SessionState;
use anyhow::Result;

pub const BLOCK_THRESHOLD: f64 = 60.0;
pub const WARN_THRESHOLD: f64 = 40.0;
pub const WINDOW_SECS: f64 = 120.0;
const MAX_WINDOW_ENTRIES: usize = 200;
const ANALYTICS_TOOL_PREFIX: &str = "mcp__analytics__";

pub struct RateLimit;

impl Gate for RateLimit {
    fn id(&self) -> GateId {
        GateId::RateLimit
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || call.tool_name.starts_with(ANALYTICS_TOOL_PREFIX) {
            return Ok(GateResult::pass(name));
        }

        let cutoff = ctx.now - WINDOW_SECS;
        let window = &mut state.rate_window_timestamps;
        window.push(ctx.now);
        window.retain(|t| *t > cutoff);
        if window.len() > MAX_WINDOW_ENTRIES {
            let excess = window.len() - MAX_WINDOW_ENTRIES;
            window.drain(..excess);
        }

        let calls = window.len();
        if calls <= 1 {
            return Ok(GateResult::pass(name));
        }
        let rate = calls as f64 / (WINDOW_SECS / 60.0);

        let block_at = state
            .tune_override(self.id().module_name(), "block_threshold")
            .unwrap_or(BLOCK_THRESHOLD);
        if rate > block_at {
            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED: Tool call rate is {:.1} calls/min ({} calls in {}s window, limit: {}/min). Slow down: batch work or wait before the next call.",
                    name, rate, calls, WINDOW_SECS as i64, block_at
                ),
            ));
        }
        if rate > WARN_THRESHOLD {
            return Ok(GateResult::warn(
                name,
                format!(
                    "[{}] WARNING: Tool call rate is {:.1} calls/min ({} calls in {}s window, warn: {}/min). Consider slowing down.",
                    name, rate, calls, WINDOW_SECS as i64, WARN_THRESHOLD
                ),
            ));
        }
        Ok(GateResult::pass(name))
    }
}
