//! Gate 16: code quality.
//!
//! Scans the text an edit introduces for secrets, debug statements and broad
//! exception handlers. Warnings escalate per file and block past the limit;
//! a clean edit resets the file's counter.

use super::{Gate, GateContext, GateId};
use crate::gate_result::{GateResult, Severity};
use crate::hook::{basename, extension, ToolCall};
use crate::state::SessionState;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_WARNINGS: u32 = 3;

const CODE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".tsx", ".jsx", ".go", ".rs", ".java", ".rb", ".sh",
];

struct Pattern {
    name: &'static str,
    regex: Regex,
    /// Non-escalating patterns warn without touching the counter
    escalates: bool,
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    [
        (
            "secret-in-code",
            r#"(?i)(api_key|api_secret|password|secret_key|access_token|private_key)\s*=\s*["'][^"']{8,}["']"#,
            true,
        ),
        (
            "debug-print",
            r"^\s*(print\(|console\.log\(|debugger;|import pdb|breakpoint\(\))",
            true,
        ),
        ("broad-except", r"except\s*:|except\s+Exception\s*:", true),
        ("todo-fixme", r"(?i)\b(TODO|FIXME|HACK|XXX)\b", false),
    ]
    .into_iter()
    .filter_map(|(name, pattern, escalates)| {
        Regex::new(pattern).ok().map(|regex| Pattern {
            name,
            regex,
            escalates,
        })
    })
    .collect()
});

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub name: &'static str,
    pub line: usize,
    pub escalates: bool,
}

/// First matching line per pattern
pub fn scan_content(content: &str) -> Vec<Violation> {
    PATTERNS
        .iter()
        .filter_map(|p| {
            content
                .split('\n')
                .position(|line| p.regex.is_match(line))
                .map(|idx| Violation {
                    name: p.name,
                    line: idx + 1,
                    escalates: p.escalates,
                })
        })
        .collect()
}

fn new_content(call: &ToolCall) -> &str {
    match call.tool_name.as_str() {
        "Edit" => call.input_str("new_string"),
        "Write" => call.input_str("content"),
        "NotebookEdit" => call.input_str("new_source"),
        _ => "",
    }
}

pub struct CodeQuality;

impl Gate for CodeQuality {
    fn id(&self) -> GateId {
        GateId::CodeQuality
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
        if ctx.exemptions.is_exempt_full(file_path)
            || !CODE_EXTENSIONS.contains(&extension(file_path).as_str())
        {
            return Ok(GateResult::pass(name));
        }
        let content = new_content(call);
        if content.trim().is_empty() {
            return Ok(GateResult::pass(name));
        }

        let violations = scan_content(content);
        if violations.is_empty() {
            state.code_quality_warnings_per_file.remove(file_path);
            return Ok(GateResult::pass(name));
        }

        let escalating = violations.iter().any(|v| v.escalates);
        let count = {
            let entry = state
                .code_quality_warnings_per_file
                .entry(file_path.to_string())
                .or_insert(0);
            if escalating {
                *entry += 1;
            }
            *entry
        };
        if count == 0 {
            state.code_quality_warnings_per_file.remove(file_path);
        }

        let detail = violations
            .iter()
            .map(|v| format!("{} (line {})", v.name, v.line))
            .collect::<Vec<_>>()
            .join(", ");

        if escalating && count > MAX_WARNINGS {
            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED: Code quality issues: {}. ({} violations on {}, exceeded {} warning limit). Re-edit without the violation to clear. If also blocked by Gate 6, call remember_this() first.",
                    name,
                    detail,
                    count,
                    basename(file_path),
                    MAX_WARNINGS
                ),
            )
            .with_severity(Severity::Warn));
        }
        Ok(GateResult::warn(
            name,
            format!(
                "[{}] WARNING ({}/{}): {} in {}",
                name,
                count,
                MAX_WARNINGS,
                detail,
                basename(file_path)
            ),
        ))
    }
}
