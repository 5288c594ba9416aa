//! Gate 5: proof before fixed.
//!
//! Edits pile up in `pending_verification` until a Bash command verifies
//! them. Too many unverified files, or too many edits to one file, block.

use super::{Gate, GateContext, GateId};
use crate::exemptions::is_test_file;
use crate::gate_result::GateResult;
use crate::hook::{basename, ToolCall};
use crate::state::SessionState;
use anyhow::Result;

pub const BLOCK_THRESHOLD: f64 = 3.0;
const STREAK_WARN: u32 = 3;
const STREAK_BLOCK: u32 = 5;

pub struct ProofBeforeFixed;

impl Gate for ProofBeforeFixed {
    fn id(&self) -> GateId {
        GateId::ProofBeforeFixed
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || !call.is_edit_tool() {
            return Ok(GateResult::pass(name));
        }
        let file_path = call.target_path();
        if ctx.exemptions.is_exempt_base(file_path) || is_test_file(file_path) {
            return Ok(GateResult::pass(name));
        }

        let streak = state.edit_streak.get(file_path).copied().unwrap_or(0);
        if streak >= STREAK_BLOCK {
            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED: {} edited {} times without verification. Run any Bash command (test, script, or check) to reset and continue.",
                    name,
                    basename(file_path),
                    streak + 1
                ),
            ));
        }

        let pending_other: Vec<&String> = state
            .pending_verification
            .iter()
            .filter(|p| p.as_str() != file_path)
            .collect();
        let effective: f64 = pending_other
            .iter()
            .map(|p| {
                let scored = state
                    .verification_scores
                    .get(p.as_str())
                    .map(|s| *s > 0.0)
                    .unwrap_or(false);
                if scored {
                    0.5
                } else {
                    1.0
                }
            })
            .sum();
        let block_at = state
            .tune_override(self.id().module_name(), "block_threshold")
            .unwrap_or(BLOCK_THRESHOLD);

        if effective >= block_at {
            let files: Vec<&str> = pending_other.iter().take(5).map(|p| basename(p)).collect();
            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED: {} files with unverified edits ({}). Run any Bash command (pytest, python script, etc.) to verify and clear pending files.",
                    name,
                    pending_other.len(),
                    files.join(", ")
                ),
            ));
        }

        if streak >= STREAK_WARN {
            return Ok(GateResult::warn(
                name,
                format!(
                    "[{}] WARNING: {} edited {} times without verification. Run any Bash command (test, lint, script) to verify and reset the counter.",
                    name,
                    basename(file_path),
                    streak + 1
                ),
            ));
        }

        Ok(GateResult::pass(name))
    }
}
