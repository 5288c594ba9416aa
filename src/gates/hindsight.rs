//! Gate 19: hindsight.
//!
//! Reads the mentor signals the tracker leaves in state and stops edits when
//! quality has stayed poor across several evaluations. Off unless the
//! `mentor_hindsight_gate` or `mentor_all` toggle is set.

use super::{Gate, GateContext, GateId};
use crate::gate_result::{GateResult, Severity};
use crate::hook::ToolCall;
use crate::state::SessionState;
use anyhow::Result;

const SCORE_BLOCK_THRESHOLD: f64 = 0.3;
const ESCALATION_BLOCK_THRESHOLD: u32 = 2;
const CHAIN_SCORE_WARN_THRESHOLD: f64 = 0.3;

pub struct Hindsight;

impl Gate for Hindsight {
    fn id(&self) -> GateId {
        GateId::Hindsight
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
        if !(ctx.toggles.flag("mentor_hindsight_gate") || ctx.toggles.flag("mentor_all")) {
            return Ok(GateResult::pass(name));
        }
        // Gate 15 owns the error-fixing loop
        if state.fixing_error || ctx.exemptions.is_exempt_standard(call.target_path()) {
            return Ok(GateResult::pass(name));
        }

        if state.mentor_last_score < SCORE_BLOCK_THRESHOLD
            && state.mentor_escalation_count >= ESCALATION_BLOCK_THRESHOLD
        {
            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED: Mentor score critically low ({:.2}) with {} consecutive escalations. Last verdict: {}. Run tests, verify your approach, or check memory for prior solutions.",
                    name,
                    state.mentor_last_score,
                    state.mentor_escalation_count,
                    state.mentor_last_verdict
                ),
            )
            .with_severity(Severity::Error));
        }

        if state.mentor_warned_this_cycle {
            return Ok(GateResult::pass(name));
        }
        if state.mentor_chain_score < CHAIN_SCORE_WARN_THRESHOLD {
            let pattern = if state.mentor_chain_pattern.is_empty() {
                "unknown"
            } else {
                state.mentor_chain_pattern.as_str()
            };
            return Ok(GateResult::warn(
                name,
                format!(
                    "[{}] WARNING: Outcome chain score low ({:.2}, pattern: {}). Consider changing approach.",
                    name, state.mentor_chain_score, pattern
                ),
            ));
        }
        let has_match = state
            .mentor_memory_match
            .as_ref()
            .is_some_and(|m| m.is_object());
        if has_match && !state.mentor_historical_context.is_empty() {
            return Ok(GateResult::new(
                false,
                format!("[{}] INFO: {}", name, state.mentor_historical_context),
                name,
            ));
        }
        Ok(GateResult::pass(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::test_support::Fixture;
    use serde_json::json;

    fn enabled() -> Fixture {
        Fixture::new().with_toggles(json!({"mentor_hindsight_gate": true}))
    }

    fn edit() -> ToolCall {
        ToolCall::pre("Edit", json!({"file_path": "/p/core.py"}))
    }

    #[test]
    fn test_disabled_by_default() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        state.mentor_last_score = 0.1;
        state.mentor_escalation_count = 5;
        assert!(!Hindsight.check(&edit(), &mut state, &fx.ctx(0.0)).unwrap().blocked);
    }

    #[test]
    fn test_blocks_on_sustained_escalation() {
        let fx = enabled();
        let mut state = SessionState::new_at(0.0);
        state.mentor_last_score = 0.2;
        state.mentor_escalation_count = 2;
        state.mentor_last_verdict = "escalate".into();
        let result = Hindsight.check(&edit(), &mut state, &fx.ctx(0.0)).unwrap();
        assert!(result.blocked);
        assert_eq!(result.severity, Severity::Error);
        assert!(result.message.contains("critically low (0.20) with 2 consecutive escalations"));

        state.fixing_error = true;
        assert!(!Hindsight.check(&edit(), &mut state, &fx.ctx(0.0)).unwrap().blocked);
    }

    #[test]
    fn test_chain_warning_and_memory_info() {
        let fx = Fixture::new().with_toggles(json!({"mentor_all": true}));
        let mut state = SessionState::new_at(0.0);
        state.mentor_chain_score = 0.2;
        state.mentor_chain_pattern = "churn".into();
        let result = Hindsight.check(&edit(), &mut state, &fx.ctx(0.0)).unwrap();
        assert!(result.is_warning());
        assert!(result.message.contains("pattern: churn"));

        state.mentor_chain_score = 1.0;
        state.mentor_memory_match = Some(json!({"id": "m1"}));
        state.mentor_historical_context = "Similar fix worked before".into();
        let result = Hindsight.check(&edit(), &mut state, &fx.ctx(0.0)).unwrap();
        assert_eq!(result.severity, Severity::Info);
        assert!(result.message.ends_with("INFO: Similar fix worked before"));

        state.mentor_warned_this_cycle = true;
        assert!(Hindsight.check(&edit(), &mut state, &fx.ctx(0.0)).unwrap().message.is_empty());
    }
}
