//! Gate 1: read before edit.
//!
//! Code files must have been Read this session (or a related file, such as
//! the module under test) before they may be edited. Writing a new file is
//! always allowed.

use super::{Gate, GateContext, GateId};
use crate::exemptions::is_related_file;
use crate::gate_result::GateResult;
use crate::hook::{basename, extension, normpath, ToolCall};
use crate::state::SessionState;
use anyhow::Result;
use std::path::Path;

const GUARDED_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".jsx", ".tsx", ".rs", ".go", ".java", ".c", ".cpp", ".rb", ".php",
    ".sh", ".sql", ".tf", ".ipynb",
];

const EXEMPT_BASENAMES: &[&str] = &[
    "__init__.py",
    "HANDOFF.md",
    "LIVE_STATE.json",
    "CLAUDE.md",
    "state.json",
];

/// Symlinks resolved when the path exists, lexical normalization otherwise
fn realpath(path: &str) -> String {
    std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| normpath(path))
}

pub struct ReadBeforeEdit;

impl Gate for ReadBeforeEdit {
    fn id(&self) -> GateId {
        GateId::ReadBeforeEdit
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        _ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || !call.is_edit_tool() {
            return Ok(GateResult::pass(name));
        }

        let file_path = normpath(call.target_path());
        if !GUARDED_EXTENSIONS.contains(&extension(&file_path).as_str()) {
            return Ok(GateResult::pass(name));
        }
        if EXEMPT_BASENAMES.contains(&basename(&file_path)) {
            return Ok(GateResult::pass(name));
        }
        if call.tool_name == "Write" && !Path::new(&file_path).exists() {
            return Ok(GateResult::pass(name));
        }

        let target = realpath(&file_path);
        let mut related = false;
        for read in &state.files_read {
            let read_real = realpath(read);
            if read_real == target {
                return Ok(GateResult::pass(name));
            }
            related |= is_related_file(&read_real, &target);
        }
        if related {
            return Ok(GateResult::pass(name));
        }

        Ok(GateResult::block(
            name,
            format!(
                "[{}] BLOCKED: You must Read '{}' before editing it.",
                name, file_path
            ),
        ))
    }
}
