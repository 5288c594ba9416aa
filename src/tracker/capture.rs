//! Observation capture queue.
//!
//! Each interesting tool call is compressed into one JSON line in
//! `.capture_queue.jsonl`, which the memory worker ingests on its own
//! schedule. Secrets are scrubbed before anything is written.

use super::errors::response_output;
use super::response_object;
use crate::config::Paths;
use crate::error_normalizer::fnv1a_hash;
use crate::hook::{extension, truncate_chars, ToolCall};
use crate::state::store::write_atomic;
use crate::state::SessionState;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

pub const CAPTURABLE_TOOLS: &[&str] = &[
    "Bash",
    "Edit",
    "Write",
    "NotebookEdit",
    "Read",
    "Glob",
    "Grep",
    "Skill",
    "WebSearch",
    "WebFetch",
    "Task",
];

pub const MAX_QUEUE_LINES: usize = 500;
const COMPACTED_LINES: usize = 300;
const MAX_HIGH_PRIORITY: usize = 150;
const MIN_RECENT_LINES: usize = 50;
const DEDUP_LOOKBACK: usize = 20;
/// Queue size is checked on every Nth call
const CAP_CHECK_INTERVAL: u64 = 50;

const OBSERVATION_ERROR_PATTERNS: &[&str] = &[
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
    "AssertionError:",
    "KeyError:",
    "ValueError:",
    "TypeError:",
    "AttributeError:",
    "IndexError:",
    "NameError:",
    "FileNotFoundError:",
    "RuntimeError:",
    "TimeoutError:",
    "pytest FAILED",
    "test failed",
    "ERRORS:",
    "CalledProcessError",
    "panic:",
    "segmentation fault",
    "core dumped",
    "killed",
];

/// Specific token shapes first; the generic assignment patterns would
/// otherwise swallow them
static SECRET_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"-----BEGIN[A-Z \-]*PRIVATE KEY-----[\s\S]*?-----END[A-Z \-]*PRIVATE KEY-----",
            "<PRIVATE_KEY_REDACTED>",
        ),
        (
            r"eyJ[A-Za-z0-9\-_]+\.eyJ[A-Za-z0-9\-_]+\.[A-Za-z0-9\-_]+",
            "<JWT_REDACTED>",
        ),
        (r"(?i)Bearer\s+[A-Za-z0-9\-._~+/]+=*", "Bearer <REDACTED>"),
        (r"AKIA[0-9A-Z]{16}", "<AWS_KEY_REDACTED>"),
        (r"(?:ghp_|gho_|ghs_|github_pat_)[A-Za-z0-9_]+", "<GH_TOKEN_REDACTED>"),
        (r"ssh-(rsa|ed25519|ecdsa)\s+AAAA[A-Za-z0-9+/=]+", "<SSH_KEY_REDACTED>"),
        (r"xox[bpars]-[A-Za-z0-9-]+", "<SLACK_TOKEN_REDACTED>"),
        (r"sk-ant-[A-Za-z0-9\-_]+", "<ANTHROPIC_KEY_REDACTED>"),
        (r"sk-[A-Za-z0-9]{40,}", "<SK_KEY_REDACTED>"),
        (
            r#"((?:mongodb|postgresql|postgres|mysql|redis|amqp|amqps)://)([^\s,'"]+)"#,
            "${1}<REDACTED>",
        ),
        (
            r"(?i)((?:API_KEY|SECRET|TOKEN|PASSWORD|PASSWD|MONGODB_URI|DATABASE_URL|AUTH|PRIVATE_KEY|ACCESS_KEY|SECRET_KEY|CREDENTIALS|DB_PASS|SMTP_PASS|REDIS_URL|SESSION_SECRET|JWT_SECRET|ENCRYPTION_KEY)\s*[=:]\s*)(\S+)",
            "${1}<REDACTED>",
        ),
        (
            r"([=:]\s*)[A-Za-z0-9+/\-_]{40,}=*",
            "${1}<POSSIBLE_SECRET_REDACTED>",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Redact keys, tokens and credentials from free text
pub fn scrub(text: &str) -> String {
    SECRET_PATTERNS
        .iter()
        .fold(text.to_string(), |acc, (re, replacement)| {
            re.replace_all(&acc, *replacement).into_owned()
        })
}

/// Identity of a call for near-duplicate suppression
pub fn observation_key(call: &ToolCall) -> String {
    let tool = call.tool_name.as_str();
    match tool {
        "Bash" => format!("Bash:{}", truncate_chars(call.command(), 200)),
        "Read" => format!("Read:{}", call.input_str("file_path")),
        "Edit" | "Write" => {
            let field = if tool == "Edit" { "old_string" } else { "content" };
            let snippet = truncate_chars(call.input_str(field), 100);
            if snippet.is_empty() {
                format!("{}:{}", tool, call.input_str("file_path"))
            } else {
                format!("{}:{}:{}", tool, call.input_str("file_path"), fnv1a_hash(snippet))
            }
        }
        "Glob" => format!("Glob:{}", call.input_str("pattern")),
        "Grep" => format!(
            "Grep:{}:{}",
            call.input_str("pattern"),
            call.input_str("path")
        ),
        "WebSearch" => format!("WebSearch:{}", truncate_chars(call.input_str("query"), 100)),
        "WebFetch" => format!("WebFetch:{}", call.input_str("url")),
        _ => tool.to_string(),
    }
}

fn exit_code_text(response: &Value) -> String {
    let resp = response_object(response);
    match ["exit_code", "exitCode", "status"]
        .iter()
        .find_map(|k| resp.get(*k))
    {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Output text as observations see it: stdout, then stderr on its own line
fn observation_output(response: &Value) -> String {
    match response {
        Value::Object(map) => {
            let stdout = map.get("stdout").and_then(Value::as_str).unwrap_or("");
            let stderr = map.get("stderr").and_then(Value::as_str).unwrap_or("");
            if stderr.is_empty() {
                stdout.to_string()
            } else {
                format!("{}\n{}", stdout, stderr).trim().to_string()
            }
        }
        _ => response_output(response),
    }
}

/// First executable word of a shell command, skipping env assignments and wrappers
fn command_name(command: &str) -> String {
    const WRAPPERS: &[&str] = &["sudo", "env", "nohup", "time", "nice"];
    command
        .split_whitespace()
        .find(|part| !part.contains('=') && !WRAPPERS.contains(part))
        .or_else(|| command.split_whitespace().next())
        .map(|part| part.rsplit('/').next().unwrap_or(part).to_string())
        .unwrap_or_default()
}

fn priority(tool: &str, has_error: bool) -> &'static str {
    if has_error {
        return "high";
    }
    match tool {
        "Edit" | "Write" | "NotebookEdit" | "Bash" | "WebSearch" | "WebFetch" | "Task" => "medium",
        _ => "low",
    }
}

fn sentiment(tool: &str, state: &SessionState, now: f64) -> &'static str {
    if matches!(tool, "Edit" | "Write") && state.error_pattern_counts.values().any(|c| *c >= 2) {
        return "frustration";
    }
    if state.last_test_exit_code == Some(0) && now - state.last_test_run < 120.0 {
        return "confidence";
    }
    if matches!(tool, "Read" | "Grep" | "Glob" | "WebSearch" | "WebFetch") {
        return "exploration";
    }
    ""
}

fn iso_timestamp(now: f64) -> String {
    chrono::DateTime::from_timestamp(now.trunc() as i64, (now.fract() * 1e9) as u32)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Compact `{document, metadata, id}` record for one tool call
pub fn compress_observation(
    call: &ToolCall,
    response: &Value,
    session_id: &str,
    state: &SessionState,
    now: f64,
) -> Value {
    let tool = call.tool_name.as_str();
    let mut error_pattern = String::new();
    let mut exit_code = String::new();
    let mut command_hash = String::new();
    let mut context = Map::new();

    let document = match tool {
        "Bash" => {
            let command = call.command();
            let output = observation_output(response);
            exit_code = exit_code_text(response);
            error_pattern = OBSERVATION_ERROR_PATTERNS
                .iter()
                .find(|p| output.contains(*p))
                .map(|p| p.to_string())
                .unwrap_or_default();
            command_hash = fnv1a_hash(command);
            context.insert("exit_code".into(), json!(exit_code));
            context.insert("cmd".into(), json!(command_name(command)));
            context.insert("cwd".into(), json!(call.input_str("cwd")));
            if !error_pattern.is_empty() {
                context.insert("error_pattern".into(), json!(error_pattern));
            }
            format!(
                "Bash: {} → EXIT {} | {} | {}",
                scrub(truncate_chars(command, 200)),
                exit_code,
                error_pattern,
                scrub(truncate_chars(&output, 300))
            )
        }
        "Edit" | "Write" | "NotebookEdit" | "Read" => {
            let path = call.target_path();
            context.insert("file_path".into(), json!(path));
            context.insert("file_extension".into(), json!(extension(path)));
            match tool {
                "Edit" => {
                    let old = call.input_str("old_string");
                    let lines = if old.is_empty() { 0 } else { old.matches('\n').count() + 1 };
                    format!("Edit: {} (~{} lines changed)", path, lines)
                }
                "Write" => format!(
                    "Write: {} ({} chars)",
                    path,
                    call.input_str("content").chars().count()
                ),
                "NotebookEdit" => {
                    let cell = call
                        .tool_input
                        .get("cell_number")
                        .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                        .unwrap_or_else(|| "?".into());
                    let mode = match call.input_str("edit_mode") {
                        "" => "replace",
                        m => m,
                    };
                    format!("NotebookEdit: {} cell {} ({})", path, cell, mode)
                }
                _ => format!("Read: {}", path),
            }
        }
        "Glob" | "Grep" => {
            let pattern = call.input_str("pattern");
            let path = call.input_str("path");
            context.insert("pattern".into(), json!(pattern));
            context.insert("path".into(), json!(path));
            format!("{}: {} in {}", tool, pattern, if path.is_empty() { "." } else { path })
        }
        "Skill" => {
            let skill = match call.input_str("skill") {
                "" => call.input_str("name"),
                s => s,
            };
            context.insert("skill_name".into(), json!(skill));
            format!("Skill: {}", skill)
        }
        "WebSearch" => {
            let query = call.input_str("query");
            context.insert("query".into(), json!(query));
            format!("WebSearch: {}", truncate_chars(query, 100))
        }
        "WebFetch" => {
            let url = call.input_str("url");
            context.insert("url".into(), json!(url));
            format!("WebFetch: {}", url)
        }
        "Task" => {
            let subagent = call.input_str("subagent_type");
            let model = call.input_str("model");
            context.insert("subagent_type".into(), json!(subagent));
            context.insert("model".into(), json!(model));
            let mut doc = format!(
                "Task: {} - {}",
                subagent,
                truncate_chars(call.input_str("description"), 80)
            );
            if !model.is_empty() {
                doc.push_str(&format!(" (model={})", model));
            }
            doc
        }
        _ => format!("{}: (uncategorized)", tool),
    };

    let has_error = !error_pattern.is_empty() || !matches!(exit_code.as_str(), "" | "0");
    let digest = Sha256::digest(format!("{}_{}_{}", document, session_id, now).as_bytes());
    let id: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();

    json!({
        "document": document,
        "metadata": {
            "tool_name": tool,
            "session_id": session_id,
            "session_time": now,
            "timestamp": iso_timestamp(now),
            "has_error": if has_error { "true" } else { "false" },
            "error_pattern": error_pattern,
            "exit_code": exit_code,
            "command_hash": command_hash,
            "priority": priority(tool, has_error),
            "sentiment": sentiment(tool, state, now),
            "context": if context.is_empty() { String::new() } else { Value::Object(context).to_string() },
        },
        "id": format!("obs_{}", id),
    })
}

/// Hash already present among the last few queued lines
fn is_recent_duplicate(queue: &Path, hash: &str) -> bool {
    let Ok(content) = fs::read_to_string(queue) else {
        return false;
    };
    let needle = format!("\"_obs_hash\":\"{}\"", hash);
    content
        .lines()
        .rev()
        .take(DEDUP_LOOKBACK)
        .any(|line| line.contains(&needle))
}

/// Append one observation unless it repeats a recent one. Never fails the tracker.
pub fn capture_observation(
    paths: &Paths,
    call: &ToolCall,
    response: &Value,
    session_id: &str,
    state: &SessionState,
    now: f64,
) {
    if !CAPTURABLE_TOOLS.contains(&call.tool_name.as_str()) {
        return;
    }
    if let Err(e) = append_observation(paths, call, response, session_id, state, now) {
        tracing::debug!(tool = %call.tool_name, error = %e, "observation capture failed");
    }
}

fn append_observation(
    paths: &Paths,
    call: &ToolCall,
    response: &Value,
    session_id: &str,
    state: &SessionState,
    now: f64,
) -> Result<()> {
    let queue = paths.capture_queue();
    let hash = fnv1a_hash(&observation_key(call));
    if is_recent_duplicate(&queue, &hash) {
        return Ok(());
    }

    let mut obs = compress_observation(call, response, session_id, state, now);
    obs["_obs_hash"] = Value::String(hash);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&queue)
        .with_context(|| format!("Failed to open {}", queue.display()))?;
    writeln!(file, "{}", obs)?;

    if state.tool_call_count % CAP_CHECK_INTERVAL == 0 {
        cap_queue_file(&queue)?;
    }
    Ok(())
}

/// Shrink an oversized queue, letting high-priority lines outlive the rest
pub fn cap_queue_file(queue: &Path) -> Result<()> {
    let content = match fs::read_to_string(queue) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", queue.display())),
    };
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() <= MAX_QUEUE_LINES {
        return Ok(());
    }

    let (high, rest): (Vec<&str>, Vec<&str>) = lines.into_iter().partition(|line| {
        serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|obs| {
                obs.get("metadata")?
                    .get("priority")
                    .and_then(Value::as_str)
                    .map(|p| p == "high")
            })
            .unwrap_or(false)
    });
    let high = &high[high.len().saturating_sub(MAX_HIGH_PRIORITY)..];
    let budget = COMPACTED_LINES.saturating_sub(high.len()).max(MIN_RECENT_LINES);
    let recent = &rest[rest.len().saturating_sub(budget)..];

    let mut kept = String::new();
    for line in high.iter().chain(recent.iter()) {
        kept.push_str(line);
        kept.push('\n');
    }
    write_atomic(queue, kept.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Paths) {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        fs::create_dir_all(&paths.hooks_dir).unwrap();
        (dir, paths)
    }

    #[test]
    fn test_scrub_redacts_secrets() {
        let text = "export API_KEY=abc123 and token ghp_ABCDEF123 via postgres://user:pw@db/x";
        let out = scrub(text);
        assert!(out.contains("API_KEY=<REDACTED>"));
        assert!(out.contains("<GH_TOKEN_REDACTED>"));
        assert!(out.contains("postgres://<REDACTED>"));
        assert!(!out.contains("pw@db"));
        assert_eq!(scrub("plain text"), "plain text");
    }

    #[test]
    fn test_observation_key() {
        let bash = ToolCall::post("Bash", json!({"command": "ls -la"}));
        assert_eq!(observation_key(&bash), "Bash:ls -la");
        let edit = ToolCall::post("Edit", json!({"file_path": "/a.py", "old_string": "x = 1"}));
        assert!(observation_key(&edit).starts_with("Edit:/a.py:"));
        let grep = ToolCall::post("Grep", json!({"pattern": "fn", "path": "src"}));
        assert_eq!(observation_key(&grep), "Grep:fn:src");
        assert_eq!(observation_key(&ToolCall::post("Task", json!({}))), "Task");
    }

    #[test]
    fn test_compress_bash_failure() {
        let state = SessionState::new_at(0.0);
        let call = ToolCall::post("Bash", json!({"command": "FOO=1 sudo pytest -x"}));
        let resp = json!({"stdout": "1 FAILED", "stderr": "", "exit_code": 1});
        let obs = compress_observation(&call, &resp, "main", &state, 1_700_000_000.0);
        assert!(obs["document"].as_str().unwrap().starts_with("Bash: FOO=1 sudo pytest -x → EXIT 1 | FAILED"));
        assert_eq!(obs["metadata"]["priority"], "high");
        assert_eq!(obs["metadata"]["has_error"], "true");
        let context: Value =
            serde_json::from_str(obs["metadata"]["context"].as_str().unwrap()).unwrap();
        assert_eq!(context["cmd"], "pytest");
        assert!(obs["id"].as_str().unwrap().starts_with("obs_"));
        assert_eq!(obs["id"].as_str().unwrap().len(), 16);
    }

    #[test]
    fn test_capture_dedups_recent() {
        let (_dir, paths) = fixture();
        let state = SessionState::new_at(0.0);
        let call = ToolCall::post("Read", json!({"file_path": "/p/a.py"}));
        capture_observation(&paths, &call, &Value::Null, "main", &state, 1.0);
        capture_observation(&paths, &call, &Value::Null, "main", &state, 2.0);
        let other = ToolCall::post("Read", json!({"file_path": "/p/b.py"}));
        capture_observation(&paths, &other, &Value::Null, "main", &state, 3.0);
        capture_observation(&paths, &ToolCall::post("TodoWrite", json!({})), &Value::Null, "main", &state, 4.0);

        let queue = fs::read_to_string(paths.capture_queue()).unwrap();
        assert_eq!(queue.lines().count(), 2);
        let first: Value = serde_json::from_str(queue.lines().next().unwrap()).unwrap();
        assert_eq!(first["metadata"]["sentiment"], "exploration");
        assert_eq!(first["metadata"]["priority"], "low");
    }

    #[test]
    fn test_cap_queue_keeps_high_priority() {
        let (_dir, paths) = fixture();
        let queue = paths.capture_queue();
        let mut body = String::new();
        for i in 0..600 {
            let priority = if i % 10 == 0 { "high" } else { "low" };
            body.push_str(&json!({"document": i, "metadata": {"priority": priority}}).to_string());
            body.push('\n');
        }
        fs::write(&queue, body).unwrap();
        cap_queue_file(&queue).unwrap();

        let kept: Vec<Value> = fs::read_to_string(&queue)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(kept.len(), 300);
        let high = kept
            .iter()
            .filter(|o| o["metadata"]["priority"] == "high")
            .count();
        assert_eq!(high, 60);
        assert_eq!(kept[0]["document"], 0);
        assert_eq!(kept.last().unwrap()["document"], 599);
    }
}
