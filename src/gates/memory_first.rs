//! Gate 4: memory first.
//!
//! Edits and non-research subagents need a recent memory query, so existing
//! knowledge is consulted before changing anything.

use super::{Gate, GateContext, GateId};
use crate::gate_result::GateResult;
use crate::hook::{basename, ToolCall};
use crate::state::SessionState;
use anyhow::Result;
use std::path::Path;

const DEFAULT_WINDOW: f64 = 300.0;
const WRITE_WINDOW: f64 = 600.0;
const RESEARCH_SUBAGENTS: &[&str] = &["researcher", "Explore"];

pub struct MemoryFirst;

impl Gate for MemoryFirst {
    fn id(&self) -> GateId {
        GateId::MemoryFirst
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
        if call.tool_name == "Task"
            && RESEARCH_SUBAGENTS.contains(&call.input_str("subagent_type"))
        {
            return Ok(GateResult::pass(name));
        }

        let file_path = call.target_path();
        if !file_path.is_empty() && ctx.exemptions.is_exempt_base(file_path) {
            *state
                .gate4_exemptions
                .entry(basename(file_path).to_string())
                .or_insert(0) += 1;
            return Ok(GateResult::pass(name));
        }

        let last_query = ctx.memory_last_queried(state);
        if call.tool_name == "Write"
            && !file_path.is_empty()
            && !Path::new(file_path).exists()
            && last_query > 0.0
        {
            return Ok(GateResult::pass(name));
        }

        let default_window = if call.tool_name == "Write" {
            WRITE_WINDOW
        } else {
            DEFAULT_WINDOW
        };
        let window = state
            .tune_override(self.id().module_name(), "freshness_window")
            .unwrap_or(default_window);

        let elapsed = ctx.now - last_query;
        if elapsed <= window {
            return Ok(GateResult::pass(name));
        }

        let msg = if last_query == 0.0 {
            format!(
                "[{}] BLOCKED: Query memory before editing. Use search_knowledge() to check for existing knowledge about what you're changing.",
                name
            )
        } else {
            format!(
                "[{}] BLOCKED: Memory last queried {} min ago. Query memory again before editing (stale knowledge window).",
                name,
                (elapsed / 60.0) as i64
            )
        };
        Ok(GateResult::block(name, msg))
    }
}
