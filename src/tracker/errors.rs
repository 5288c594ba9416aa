//! Error detection over Bash output.

use crate::state::{ErrorWindow, SessionState, UnloggedError, MAX_ERROR_WINDOWS};
use serde_json::Value;

/// Markers that make a Bash call count as an unlogged error
pub const ERROR_PATTERNS: &[&str] = &[
    "Traceback",
    "SyntaxError:",
    "ImportError:",
    "ModuleNotFoundError:",
    "Permission denied",
    "npm ERR!",
    "fatal:",
    "error[E",
    "FAILED",
    "command not found",
    "No such file or directory",
    "ConnectionRefusedError",
    "OSError:",
];

/// Signatures used to label a failing test run
const TEST_FAILURE_SIGNATURES: &[&str] = &[
    "Traceback",
    "SyntaxError:",
    "ImportError:",
    "ModuleNotFoundError:",
    "TypeError:",
    "ValueError:",
    "KeyError:",
    "AttributeError:",
    "AssertionError:",
    "NameError:",
    "FAILED",
    "npm ERR!",
    "fatal:",
];

/// Occurrences of one pattern closer together than this share a window
pub const ERROR_WINDOW_SECS: f64 = 60.0;

/// stdout followed by stderr for object responses, the text itself for strings
pub fn response_output(response: &Value) -> String {
    match response {
        Value::Object(map) => {
            let field = |key: &str| map.get(key).and_then(Value::as_str).unwrap_or("");
            format!("{}{}", field("stdout"), field("stderr"))
        }
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// First known failure signature in a test run's output, "unknown" otherwise
pub fn extract_error_pattern(response: &Value) -> String {
    let output = match response {
        Value::Object(_) | Value::String(_) => response_output(response),
        _ => return "unknown".to_string(),
    };
    TEST_FAILURE_SIGNATURES
        .iter()
        .find(|sig| output.contains(*sig))
        .map(|sig| sig.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Record at most one error per Bash call
pub fn detect_errors(command: &str, response: &Value, state: &mut SessionState, now: f64) {
    let output = response_output(response);
    let Some(pattern) = ERROR_PATTERNS.iter().find(|p| output.contains(*p)) else {
        return;
    };
    state.unlogged_errors.push(UnloggedError {
        pattern: pattern.to_string(),
        command: command.to_string(),
        timestamp: now,
    });
    *state
        .error_pattern_counts
        .entry(pattern.to_string())
        .or_insert(0) += 1;
    deduplicate_error_window(state, pattern, now);
}

/// Fold repeats of a pattern within [`ERROR_WINDOW_SECS`] into one window
pub fn deduplicate_error_window(state: &mut SessionState, pattern: &str, now: f64) {
    let windows = &mut state.error_windows;
    if let Some(window) = windows
        .iter_mut()
        .find(|w| w.pattern == pattern && now - w.last_seen <= ERROR_WINDOW_SECS)
    {
        window.last_seen = now;
        window.count += 1;
        return;
    }

    if windows.len() >= MAX_ERROR_WINDOWS {
        windows.sort_by(|a, b| a.last_seen.total_cmp(&b.last_seen));
        windows.remove(0);
    }
    windows.push(ErrorWindow {
        pattern: pattern.to_string(),
        first_seen: now,
        last_seen: now,
        count: 1,
    });
}
