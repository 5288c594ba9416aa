//! Gate 14: confidence check.
//!
//! New code work needs a test baseline and no unverified edits outstanding.
//! Iterating on a file that is already pending is allowed.

use super::{Gate, GateContext, GateId};
use crate::gate_result::{GateResult, Severity};
use crate::hook::{normpath, ToolCall};
use crate::state::SessionState;
use anyhow::Result;

/// Failed confidence signals, in check order
fn failed_signals(state: &SessionState) -> Vec<String> {
    let mut failures = Vec::new();
    if !state.session_test_baseline {
        failures.push("no test run this session".to_string());
    }
    // Unverified edits are expected while fixing a known failure
    if !state.pending_verification.is_empty() && !state.fixing_error {
        failures.push(format!(
            "{} file(s) with unverified edits",
            state.pending_verification.len()
        ));
    }
    failures
}

pub struct ConfidenceCheck;

impl Gate for ConfidenceCheck {
    fn id(&self) -> GateId {
        GateId::ConfidenceCheck
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
        if ctx.exemptions.is_exempt_full(file_path) {
            return Ok(GateResult::pass(name));
        }
        let norm = normpath(file_path);
        if state
            .pending_verification
            .iter()
            .any(|p| *p == norm || p == file_path)
        {
            return Ok(GateResult::pass(name));
        }

        let failures = failed_signals(state);
        if failures.is_empty() {
            return Ok(GateResult::pass(name));
        }
        Ok(GateResult::block(
            name,
            format!(
                "[{}] BLOCKED: Low confidence ({}). Run a Bash command (e.g. pytest) to set test baseline and clear pending verification.",
                name,
                failures.join("; ")
            ),
        )
        .with_severity(Severity::Warn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::test_support::Fixture;
    use serde_json::json;

    fn edit(path: &str) -> ToolCall {
        ToolCall::pre("Edit", json!({"file_path": path}))
    }

    #[test]
    fn test_blocks_without_baseline() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        state.pending_verification.push("/p/a.py".into());
        let result = ConfidenceCheck.check(&edit("/p/b.py"), &mut state, &fx.ctx(0.0)).unwrap();
        assert!(result.blocked);
        assert!(result
            .message
            .contains("Low confidence (no test run this session; 1 file(s) with unverified edits)"));

        state.session_test_baseline = true;
        state.fixing_error = true;
        assert!(!ConfidenceCheck.check(&edit("/p/b.py"), &mut state, &fx.ctx(0.0)).unwrap().blocked);
    }

    #[test]
    fn test_re_edit_and_exempt_files_pass() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        state.pending_verification.push("/p/a.py".into());
        assert!(!ConfidenceCheck.check(&edit("/p/a.py"), &mut state, &fx.ctx(0.0)).unwrap().blocked);
        assert!(!ConfidenceCheck.check(&edit("/p/README.md"), &mut state, &fx.ctx(0.0)).unwrap().blocked);
        assert!(!ConfidenceCheck.check(&edit("/p/test_a.py"), &mut state, &fx.ctx(0.0)).unwrap().blocked);
    }
}
