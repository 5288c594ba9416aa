//! Gate 15: causal chain enforcement.
//!
//! After a test failure, code edits wait until fix history has been queried,
//! so earlier failed strategies are known before the next attempt.

use super::{Gate, GateContext, GateId};
use crate::gate_result::{GateResult, Severity};
use crate::hook::ToolCall;
use crate::state::SessionState;
use anyhow::Result;

pub const FIX_HISTORY_FRESHNESS: f64 = 300.0;

pub struct CausalChain;

impl Gate for CausalChain {
    fn id(&self) -> GateId {
        GateId::CausalChain
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || !call.is_edit_tool() || !state.fixing_error {
            return Ok(GateResult::pass(name));
        }
        let Some(failure) = state.recent_test_failure.as_ref() else {
            return Ok(GateResult::pass(name));
        };
        if ctx.exemptions.is_exempt_standard(call.target_path()) {
            return Ok(GateResult::pass(name));
        }

        let freshness = state
            .tune_override(self.id().module_name(), "fix_history_freshness")
            .unwrap_or(FIX_HISTORY_FRESHNESS);
        if state.fix_history_queried > 0.0 && ctx.now - state.fix_history_queried <= freshness {
            return Ok(GateResult::pass(name));
        }

        let pattern = if failure.pattern.is_empty() {
            "unknown"
        } else {
            failure.pattern.as_str()
        };
        let failure_age = if failure.timestamp > 0.0 {
            (ctx.now - failure.timestamp) as i64
        } else {
            0
        };
        Ok(GateResult::block(
            name,
            format!(
                "[{}] BLOCKED: Test failure detected ({}, {}s ago) but query_fix_history() not called. Call query_fix_history(\"{}\") before editing code to check what strategies have been tried.",
                name, pattern, failure_age, pattern
            ),
        )
        .with_severity(Severity::Error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::test_support::Fixture;
    use crate::state::TestFailure;
    use serde_json::json;

    const NOW: f64 = 9_000.0;

    fn failing_state() -> SessionState {
        let mut state = SessionState::new_at(NOW - 600.0);
        state.fixing_error = true;
        state.recent_test_failure = Some(TestFailure {
            pattern: "AssertionError".into(),
            timestamp: NOW - 45.0,
            command: "pytest".into(),
        });
        state
    }

    #[test]
    fn test_blocks_until_history_queried() {
        let fx = Fixture::new();
        let mut state = failing_state();
        let call = ToolCall::pre("Edit", json!({"file_path": "/p/calc.py"}));
        let result = CausalChain.check(&call, &mut state, &fx.ctx(NOW)).unwrap();
        assert!(result.blocked);
        assert_eq!(result.severity, Severity::Error);
        assert!(result.message.contains("(AssertionError, 45s ago)"));
        assert!(result.message.contains("query_fix_history(\"AssertionError\")"));

        state.fix_history_queried = NOW - 100.0;
        assert!(!CausalChain.check(&call, &mut state, &fx.ctx(NOW)).unwrap().blocked);
    }

    #[test]
    fn test_inactive_without_error_context() {
        let fx = Fixture::new();
        let mut state = failing_state();
        state.fixing_error = false;
        let call = ToolCall::pre("Edit", json!({"file_path": "/p/calc.py"}));
        assert!(!CausalChain.check(&call, &mut state, &fx.ctx(NOW)).unwrap().blocked);

        let mut state = failing_state();
        let test_file = ToolCall::pre("Edit", json!({"file_path": "/p/test_calc.py"}));
        assert!(!CausalChain.check(&test_file, &mut state, &fx.ctx(NOW)).unwrap().blocked);
    }
}
