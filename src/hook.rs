//! Hook protocol types shared by the enforcer, tracker, daemon and shim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tools that edit files
pub const EDIT_TOOLS: &[&str] = &["Edit", "Write", "NotebookEdit"];

/// Which hook point fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
}

/// Payload the host writes to the hook's stdin
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HookInput {
    #[serde(default = "default_session_id")]
    pub session_id: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub tool_response: Value,
}

fn default_session_id() -> String {
    "main".to_string()
}

impl HookInput {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        let mut input: HookInput = serde_json::from_str(raw)?;
        if input.session_id.is_empty() {
            input.session_id = default_session_id();
        }
        Ok(input)
    }

    /// True when `tool_input` is missing, null, or an empty object/string
    pub fn tool_input_is_empty(&self) -> bool {
        match &self.tool_input {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            _ => false,
        }
    }
}

/// A tool call as gates see it
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_input: Map<String, Value>,
    pub event: HookEvent,
}

impl ToolCall {
    /// Non-object inputs are treated as empty
    pub fn new(tool_name: impl Into<String>, tool_input: &Value, event: HookEvent) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_input: tool_input.as_object().cloned().unwrap_or_default(),
            event,
        }
    }

    pub fn pre(tool_name: impl Into<String>, tool_input: Value) -> Self {
        Self::new(tool_name, &tool_input, HookEvent::PreToolUse)
    }

    pub fn post(tool_name: impl Into<String>, tool_input: Value) -> Self {
        Self::new(tool_name, &tool_input, HookEvent::PostToolUse)
    }

    pub fn is_pre(&self) -> bool {
        self.event == HookEvent::PreToolUse
    }

    /// String field, or "" when missing or not a string
    pub fn input_str(&self, key: &str) -> &str {
        self.tool_input
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn is_edit_tool(&self) -> bool {
        EDIT_TOOLS.contains(&self.tool_name.as_str())
    }

    /// `file_path`, falling back to `notebook_path`
    pub fn target_path(&self) -> &str {
        let file_path = self.input_str("file_path");
        if !file_path.is_empty() {
            return file_path;
        }
        self.input_str("notebook_path")
    }

    /// First non-blank of `file_path`, `notebook_path`, `path`, trimmed
    pub fn primary_path(&self) -> &str {
        for key in ["file_path", "notebook_path", "path"] {
            let value = self.input_str(key).trim();
            if !value.is_empty() {
                return value;
            }
        }
        ""
    }

    pub fn command(&self) -> &str {
        self.input_str("command")
    }
}

/// What a hook invocation produces: an exit code plus captured streams
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutcome {
    pub exit_code: i32,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub stdout: String,
}

impl HookOutcome {
    pub fn allow() -> Self {
        Self::default()
    }

    /// Exit 2 with `message` on stderr
    pub fn block(message: impl Into<String>) -> Self {
        let mut outcome = Self {
            exit_code: 2,
            ..Self::default()
        };
        outcome.eprintln(message);
        outcome
    }

    pub fn is_blocked(&self) -> bool {
        self.exit_code == 2
    }

    pub fn eprintln(&mut self, line: impl Into<String>) {
        self.stderr.push_str(&line.into());
        self.stderr.push('\n');
    }

    pub fn println(&mut self, line: impl Into<String>) {
        self.stdout.push_str(&line.into());
        self.stdout.push('\n');
    }

    /// Write the captured streams to the real stdout/stderr
    pub fn emit(&self) {
        use std::io::Write;
        if !self.stdout.is_empty() {
            let mut out = std::io::stdout();
            let _ = out.write_all(self.stdout.as_bytes());
            let _ = out.flush();
        }
        if !self.stderr.is_empty() {
            let mut err = std::io::stderr();
            let _ = err.write_all(self.stderr.as_bytes());
            let _ = err.flush();
        }
    }
}

/// Truncate to at most `max` characters without splitting a code point
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Final path component, like `basename(1)`
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Lexical path normalization: collapses `.`, `..` and repeated separators
pub fn normpath(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().map(|p| *p != "..").unwrap_or(false) {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Extension including the dot, lowercased; "" when there is none
pub fn extension(path: &str) -> String {
    let base = basename(path);
    match base.rfind('.') {
        Some(idx) if idx > 0 => base[idx..].to_lowercase(),
        _ => String::new(),
    }
}

/// Basename without its extension
pub fn file_stem(path: &str) -> &str {
    let base = basename(path);
    match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_defaults() {
        let input = HookInput::parse(r#"{"tool_name": "Bash"}"#).unwrap();
        assert_eq!(input.session_id, "main");
        assert!(input.tool_input_is_empty());

        let input =
            HookInput::parse(r#"{"tool_name": "Edit", "session_id": "", "tool_input": {"a": 1}}"#)
                .unwrap();
        assert_eq!(input.session_id, "main");
        assert!(!input.tool_input_is_empty());
    }

    #[test]
    fn test_tool_call_paths() {
        let call = ToolCall::pre("NotebookEdit", json!({"notebook_path": "/a/b.ipynb"}));
        assert_eq!(call.target_path(), "/a/b.ipynb");
        assert_eq!(call.primary_path(), "/a/b.ipynb");
        assert!(call.is_edit_tool());

        let call = ToolCall::pre("Grep", json!({"path": "  /src  ", "pattern": 3}));
        assert_eq!(call.target_path(), "");
        assert_eq!(call.primary_path(), "/src");
        assert_eq!(call.input_str("pattern"), "");
    }

    #[test]
    fn test_non_object_input_is_empty() {
        let call = ToolCall::pre("Bash", json!("ls"));
        assert!(call.tool_input.is_empty());
        assert_eq!(call.command(), "");
    }

    #[test]
    fn test_outcome_block() {
        let outcome = HookOutcome::block("[X] BLOCKED");
        assert!(outcome.is_blocked());
        assert_eq!(outcome.stderr, "[X] BLOCKED\n");
        assert!(outcome.stdout.is_empty());
    }

    #[test]
    fn test_normpath() {
        assert_eq!(normpath("/a/./b//c/../d"), "/a/b/d");
        assert_eq!(normpath("a/../../b"), "../b");
        assert_eq!(normpath("/.."), "/");
        assert_eq!(normpath(""), ".");
    }

    #[test]
    fn test_path_parts() {
        assert_eq!(basename("/x/y/foo.test.js"), "foo.test.js");
        assert_eq!(extension("/x/y/foo.test.JS"), ".js");
        assert_eq!(extension("/x/.bashrc"), "");
        assert_eq!(file_stem("/x/test_foo.py"), "test_foo");
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
