//! Gate 13: workspace isolation.
//!
//! Team sessions must not edit a file another session has claimed. Solo work
//! (session `main`) is never checked.

use super::{Gate, GateContext, GateId};
use crate::gate_result::{GateResult, Severity};
use crate::hook::{normpath, ToolCall};
use crate::state::claims::{clean_stale_claims, read_claims};
use crate::state::SessionState;
use anyhow::Result;

pub struct WorkspaceIsolation;

impl Gate for WorkspaceIsolation {
    fn id(&self) -> GateId {
        GateId::WorkspaceIsolation
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
        let session_id = state.session_id_or_main();
        if session_id == "main" || call.target_path().is_empty() {
            return Ok(GateResult::pass(name));
        }
        let file_path = normpath(call.target_path());

        let claims = match read_claims(ctx.paths) {
            Ok(claims) => clean_stale_claims(claims, ctx.now),
            Err(e) => {
                return Ok(GateResult::warn(
                    name,
                    format!("[{}] WARNING: Gate crashed (non-blocking): {:#}", name, e),
                ));
            }
        };

        match claims.get(&file_path) {
            Some(claim) if !claim.session_id.is_empty() && claim.session_id != session_id => {
                let age_minutes = ((ctx.now - claim.claimed_at) / 60.0) as i64;
                Ok(GateResult::block(
                    name,
                    format!(
                        "[{}] BLOCKED: File '{}' is currently being edited by session '{}' (claimed {}m ago). Wait for the other agent to finish or work on a different file.",
                        name, file_path, claim.session_id, age_minutes
                    ),
                )
                .with_severity(Severity::Warn))
            }
            _ => Ok(GateResult::pass(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::test_support::Fixture;
    use crate::state::claims::claim_file;
    use serde_json::json;

    const NOW: f64 = 5_000.0;

    fn state_for(session: &str) -> SessionState {
        let mut state = SessionState::new_at(NOW);
        state.session_id = session.to_string();
        state
    }

    #[test]
    fn test_blocks_other_sessions_claim() {
        let fx = Fixture::new();
        claim_file(&fx.paths, "/p/shared.py", "agent-a", NOW - 300.0).unwrap();
        let call = ToolCall::pre("Edit", json!({"file_path": "/p/./shared.py"}));

        let mut other = state_for("agent-b");
        let result = WorkspaceIsolation.check(&call, &mut other, &fx.ctx(NOW)).unwrap();
        assert!(result.blocked);
        assert!(result.message.contains("edited by session 'agent-a' (claimed 5m ago)"));

        let mut owner = state_for("agent-a");
        assert!(!WorkspaceIsolation.check(&call, &mut owner, &fx.ctx(NOW)).unwrap().blocked);
    }

    #[test]
    fn test_main_and_stale_claims_pass() {
        let fx = Fixture::new();
        claim_file(&fx.paths, "/p/shared.py", "agent-a", NOW - 2000.0).unwrap();
        let call = ToolCall::pre("Write", json!({"file_path": "/p/shared.py"}));

        let mut other = state_for("agent-b");
        assert!(!WorkspaceIsolation.check(&call, &mut other, &fx.ctx(NOW)).unwrap().blocked);

        let mut main = state_for("");
        assert!(!WorkspaceIsolation.check(&call, &mut main, &fx.ctx(NOW)).unwrap().blocked);
    }
}
