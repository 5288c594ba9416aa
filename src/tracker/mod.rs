//! PostToolUse tracker.
//!
//! Feeds session state after every completed tool call: counters, reads and
//! edits, test results, verification evidence, error windows, causal chains
//! and the mentor. The tracker never blocks; any failure is reported as a
//! warning line and the hook still exits 0.

pub mod capture;
pub mod chains;
pub mod errors;
pub mod mentor;
pub mod mentor_analytics;
pub mod mentor_memory;
pub mod outcome_chains;
pub mod remember;
pub mod verification;

use crate::config::{Config, Paths, Toggles};
use crate::enforcer::{is_analytics_tool, is_memory_tool};
use crate::events::{self, Event};
use crate::gates::injection_defense::{is_external_tool, result_text, scan_external_result};
use crate::gates::GateId;
use crate::hook::{normpath, truncate_chars, HookEvent, HookInput, HookOutcome, ToolCall};
use crate::memory_client::MemoryClient;
use crate::state::claims::claim_file;
use crate::state::effectiveness::{update_gate_effectiveness, EffectivenessField};
use crate::state::sideband::{delete_enforcer_sideband, merge_enforcer_sideband, write_memory_sideband};
use crate::state::store::{load_state, save_state};
use crate::state::{now_secs, SessionState, SkillUse, TestFailure};
use anyhow::{Context, Result};
use remember::{AutoRemember, RememberEvent};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

/// Bash commands that count as a test run
pub const TEST_COMMANDS: &[&str] = &[
    "pytest",
    "python -m pytest",
    "npm test",
    "cargo test",
    "go test",
    "test_framework.py",
];

pub const MAX_TOOL_CALL_COUNTS: usize = 50;

/// `fixing_error` is dropped once the failure that set it is this old
pub const FIXING_ERROR_TTL_SECS: f64 = 1800.0;

/// Cap on external tool output handed to the injection scan
const MAX_SCAN_CHARS: usize = 50_000;

const HEAVY_EDIT_THRESHOLD: u32 = 3;

/// Mentor stages that start after this much mentor time are skipped
const MENTOR_BUDGET: Duration = Duration::from_millis(2500);
const REMEMBER_THIS: &str = "mcp__memory__remember_this";

/// Rough context cost of one call, by tool
fn token_estimate(tool_name: &str) -> u64 {
    match tool_name {
        "Bash" => 2000,
        "Edit" | "Write" | "NotebookEdit" => 1500,
        "Read" => 800,
        "Glob" | "Grep" => 500,
        _ => 800,
    }
}

/// A response as an object: objects as-is, JSON strings parsed, else empty
pub(crate) fn response_object(response: &Value) -> Map<String, Value> {
    match response {
        Value::Object(map) => map.clone(),
        Value::String(s) => match serde_json::from_str(s) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

/// Exit code from `exit_code`, `exitCode` or `status`, first key present wins
pub(crate) fn parse_exit_code(response: &Value) -> Option<i64> {
    let resp = response_object(response);
    let value = ["exit_code", "exitCode", "status"]
        .iter()
        .find_map(|k| resp.get(*k))?;
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn is_truthy_key(map: &Map<String, Value>, key: &str) -> bool {
    match map.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// Everything one PostToolUse invocation needs besides the state itself
pub struct TrackContext<'a> {
    pub paths: &'a Paths,
    pub toggles: &'a Toggles,
    pub remember: AutoRemember<'a>,
    pub memory: Option<&'a MemoryClient>,
    pub session_id: &'a str,
    pub now: f64,
}

pub struct Tracker {
    paths: Paths,
    memory: MemoryClient,
}

impl Tracker {
    pub fn new(config: &Config) -> Self {
        Self::with_paths(config, config.paths())
    }

    pub fn with_paths(config: &Config, paths: Paths) -> Self {
        Self {
            memory: MemoryClient::new(&paths, &config.memory),
            paths,
        }
    }

    pub fn handle_raw(&self, raw: &str) -> HookOutcome {
        self.handle_raw_at(raw, now_secs())
    }

    /// Malformed input is ignored: the call already happened
    pub fn handle_raw_at(&self, raw: &str, now: f64) -> HookOutcome {
        match HookInput::parse(raw) {
            Ok(input) => self.handle_at(input, now),
            Err(e) => {
                tracing::debug!(error = %e, "unparseable tracker input");
                HookOutcome::allow()
            }
        }
    }

    pub fn handle_at(&self, input: HookInput, now: f64) -> HookOutcome {
        if input.tool_name.is_empty() {
            return HookOutcome::allow();
        }
        match self.track(input, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "tracker failed");
                let mut outcome = HookOutcome::allow();
                outcome.eprintln(format!(
                    "[TRACKER] Warning: Tracker error (non-blocking): {:#}",
                    e
                ));
                outcome
            }
        }
    }

    fn track(&self, input: HookInput, now: f64) -> Result<HookOutcome> {
        let session_id = input.session_id.clone();
        let mut state = load_state(&self.paths, &session_id);
        state.session_id = session_id.clone();
        if let Err(e) = merge_enforcer_sideband(&mut state, &self.paths, &session_id) {
            tracing::warn!(session_id = %session_id, error = %e, "sideband merge failed");
        }

        let toggles = Toggles::load(&self.paths);
        let ctx = TrackContext {
            paths: &self.paths,
            toggles: &toggles,
            remember: AutoRemember::new(&self.paths, Some(&self.memory)),
            memory: Some(&self.memory),
            session_id: &session_id,
            now,
        };
        let call = ToolCall::new(&input.tool_name, &input.tool_input, HookEvent::PostToolUse);
        let mut outcome = HookOutcome::allow();
        handle_post_tool_use(&call, &input.tool_response, &mut state, &ctx, &mut outcome);

        let saved = save_state(&self.paths, &mut state, &session_id)
            .with_context(|| format!("Failed to save state for session {}", session_id));
        // The tracker's write now supersedes whatever the enforcer left behind
        delete_enforcer_sideband(&self.paths, &session_id);
        saved?;
        Ok(outcome)
    }
}

/// Apply one completed call to `state`. Advisories go to `out`'s stderr.
pub fn handle_post_tool_use(
    call: &ToolCall,
    response: &Value,
    state: &mut SessionState,
    ctx: &TrackContext<'_>,
    out: &mut HookOutcome,
) {
    let tool = call.tool_name.as_str();
    let now = ctx.now;

    record_counters(tool, state);
    verification::resolve_block_outcomes(call, state, ctx.paths, now);
    expire_fixing_error(state, now);
    track_files(call, state, ctx);
    track_memory(call, response, state, ctx);

    match tool {
        "Skill" => {
            let name = match call.input_str("skill") {
                "" => call.input_str("name"),
                s => s,
            };
            if !name.is_empty() {
                *state.skill_usage.entry(name.to_string()).or_insert(0) += 1;
                state.recent_skills.push(SkillUse {
                    name: name.to_string(),
                    timestamp: now,
                });
            }
        }
        "ExitPlanMode" => state.last_exit_plan_mode = now,
        "Bash" => track_test_run(call, response, state, ctx),
        _ => {}
    }

    if call.is_edit_tool() {
        track_edit(call, state, ctx);
    }
    if tool == "Bash" {
        verification::score_pending(call.command(), state, now);
        if !response.is_null() {
            errors::detect_errors(call.command(), response, state, now);
        }
    }

    chains::handle(call, response, state, now);
    scan_external_response(call, response, state, ctx, out);

    if is_analytics_tool(tool) {
        state.analytics_last_queried = now;
        state.analytics_warn_count = 0;
        let short = tool.trim_start_matches("mcp__analytics__");
        state.analytics_last_used.insert(short.to_string(), now);
    }

    capture::capture_observation(ctx.paths, call, response, ctx.session_id, state, now);
    run_mentor(call, response, state, ctx, out);
    session_nudge(state, now, out);
}

fn record_counters(tool: &str, state: &mut SessionState) {
    state.tool_call_count += 1;
    *state.tool_call_counts.entry(tool.to_string()).or_insert(0) += 1;
    state.total_tool_calls += 1;
    if state.tool_call_counts.len() > MAX_TOOL_CALL_COUNTS {
        let mut ranked: Vec<(String, u64)> = state
            .tool_call_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        ranked.sort_by_key(|(_, v)| *v);
        let excess = ranked.len() - MAX_TOOL_CALL_COUNTS;
        for (key, _) in ranked.into_iter().take(excess) {
            state.tool_call_counts.remove(&key);
        }
    }
    state.tool_stats.entry(tool.to_string()).or_default().count += 1;
    // Task tokens are tracked per subagent
    if tool != "Task" {
        state.session_token_estimate += token_estimate(tool);
    }
}

fn expire_fixing_error(state: &mut SessionState, now: f64) {
    if !state.fixing_error {
        return;
    }
    let stale = state
        .recent_test_failure
        .as_ref()
        .is_some_and(|f| now - f.timestamp > FIXING_ERROR_TTL_SECS);
    if stale {
        tracing::debug!("fixing_error expired");
        state.fixing_error = false;
        state.recent_test_failure = None;
    }
}

fn track_files(call: &ToolCall, state: &mut SessionState, ctx: &TrackContext<'_>) {
    match call.tool_name.as_str() {
        "Read" => {
            let path = call.input_str("file_path");
            if !path.is_empty() {
                let path = normpath(path);
                if !state.files_read.contains(&path) {
                    state.files_read.push(path);
                }
            }
        }
        "Edit" | "Write" => {
            let path = call.input_str("file_path");
            if !path.is_empty() {
                let path = normpath(path);
                if !state.files_edited.contains(&path) {
                    state.files_edited.push(path);
                }
            }
        }
        _ => {}
    }

    if call.is_edit_tool() {
        let path = call.target_path();
        let session = ctx.session_id;
        if !path.is_empty() && session != "main" {
            if let Err(e) = claim_file(ctx.paths, &normpath(path), session, ctx.now) {
                tracing::debug!(file = path, error = %e, "file claim failed");
            }
        }
    }
}

fn track_memory(call: &ToolCall, response: &Value, state: &mut SessionState, ctx: &TrackContext<'_>) {
    if !is_memory_tool(&call.tool_name) {
        return;
    }
    state.memory_last_queried = ctx.now;
    if let Err(e) = write_memory_sideband(ctx.paths, ctx.now) {
        tracing::debug!(error = %e, "memory sideband write failed");
    }

    if call.tool_name == REMEMBER_THIS {
        let resp = response_object(response);
        if !is_truthy_key(&resp, "rejected") && !is_truthy_key(&resp, "deduplicated") {
            state.unlogged_errors.clear();
            state.error_pattern_counts.clear();
            state.gate6_warn_count = 0;
            state.verified_fixes.clear();
        }
    }
}

/// Most recent edited files, falling back to pending ones early in a session
fn recent_edits(state: &SessionState, n: usize) -> Vec<String> {
    let source = if state.files_edited.is_empty() {
        &state.pending_verification
    } else {
        &state.files_edited
    };
    source[source.len().saturating_sub(n)..].to_vec()
}

fn track_test_run(call: &ToolCall, response: &Value, state: &mut SessionState, ctx: &TrackContext<'_>) {
    let command = call.command();
    let now = ctx.now;

    if TEST_COMMANDS.iter().any(|kw| command.contains(kw)) {
        state.last_test_run = now;
        state.last_test_command = truncate_chars(command, 200).to_string();
        state.session_test_baseline = true;
        let exit_code = parse_exit_code(response).unwrap_or(0);
        state.last_test_exit_code = Some(exit_code);

        if exit_code != 0 {
            state.recent_test_failure = Some(TestFailure {
                pattern: errors::extract_error_pattern(response),
                timestamp: now,
                command: truncate_chars(command, 200).to_string(),
            });
            state.fixing_error = true;
        } else {
            if state.fixing_error {
                let pattern = state
                    .recent_test_failure
                    .as_ref()
                    .map(|f| f.pattern.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                let edited = recent_edits(state, 5);
                ctx.remember.record(
                    RememberEvent::critical(
                        format!("Error fixed: {}. Files edited: {}", pattern, edited.join(", ")),
                        format!("Test passed after fixing error: {}", truncate_chars(command, 100)),
                        "type:auto-captured,type:fix,area:framework",
                    ),
                    state,
                    now,
                );
            }
            let edited = recent_edits(state, 10);
            let files = if edited.is_empty() {
                "none".to_string()
            } else {
                edited.join(", ")
            };
            ctx.remember.record(
                RememberEvent::queued(
                    format!(
                        "Tests passed: {}. Files modified this session: {}",
                        truncate_chars(command, 150),
                        files
                    ),
                    "auto-captured test run snapshot",
                    "type:auto-captured,area:testing",
                ),
                state,
                now,
            );
            state.recent_test_failure = None;
            state.fixing_error = false;
            state.confidence_warned_signals.clear();
        }
    }

    if command.contains("git commit") {
        ctx.remember.record(
            RememberEvent::queued(
                format!("Git commit: {}", truncate_chars(command, 200)),
                "auto-captured git commit",
                "type:auto-captured,area:git",
            ),
            state,
            now,
        );
    }
}

fn track_edit(call: &ToolCall, state: &mut SessionState, ctx: &TrackContext<'_>) {
    let path = call.target_path();
    if path.is_empty() {
        return;
    }
    if !state.pending_verification.iter().any(|p| p == path) {
        state.pending_verification.push(path.to_string());
    }
    let streak = state.edit_streak.entry(path.to_string()).or_insert(0);
    let before = *streak;
    *streak += 1;
    let after = *streak;
    if before < HEAVY_EDIT_THRESHOLD && after >= HEAVY_EDIT_THRESHOLD {
        ctx.remember.record(
            RememberEvent::queued(
                format!("Heavy editing: {} ({} edits this session)", path, after),
                "auto-captured heavy edit pattern",
                "type:auto-captured,area:framework",
            ),
            state,
            ctx.now,
        );
    }
}

/// Injection scan over what an external tool returned
fn scan_external_response(
    call: &ToolCall,
    response: &Value,
    state: &mut SessionState,
    ctx: &TrackContext<'_>,
    out: &mut HookOutcome,
) {
    let tool = call.tool_name.as_str();
    if !is_external_tool(tool) || is_empty_response(response) {
        return;
    }
    let mut text = result_text(response);
    if text.is_empty() && response.is_object() {
        text = response.to_string();
    }
    let result = scan_external_result(tool, truncate_chars(&text, MAX_SCAN_CHARS), state);
    if result.message.is_empty() {
        return;
    }
    out.eprintln(result.message);
    let gate = GateId::InjectionDefense.module_name();
    if let Err(e) = update_gate_effectiveness(ctx.paths, gate, EffectivenessField::Blocks) {
        tracing::debug!(error = %e, "effectiveness update failed");
    }
}

fn is_empty_response(response: &Value) -> bool {
    match response {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(_) => false,
    }
}

fn run_mentor(
    call: &ToolCall,
    response: &Value,
    state: &mut SessionState,
    ctx: &TrackContext<'_>,
    out: &mut HookOutcome,
) {
    let started = Instant::now();
    state.mentor_warned_this_cycle = false;
    let all = ctx.toggles.flag("mentor_all");

    if all || ctx.toggles.flag("mentor_tracker") {
        let verdict = mentor::evaluate(call, response, state, ctx.now);
        events::emit(Event::mentor_verdict(
            ctx.session_id,
            verdict.action.as_str(),
            verdict.score,
        ));
        if verdict.action.is_alarming() && !verdict.message.is_empty() {
            out.eprintln(format!("[MENTOR] {}", verdict.message));
            state.mentor_warned_this_cycle = true;
        }
    }

    if all || ctx.toggles.flag("mentor_outcome_chains") {
        if let Some(verdict) = outcome_chains::evaluate(state) {
            if !verdict.message.is_empty() && !state.mentor_warned_this_cycle {
                out.eprintln(format!("[MENTOR:CHAINS] {}", verdict.message));
            }
        }
    }

    if let Some(memory) = ctx.memory {
        if (all || ctx.toggles.flag("mentor_memory")) && started.elapsed() < MENTOR_BUDGET {
            if let Some(found) = mentor_memory::evaluate(call, state, memory) {
                if !state.mentor_warned_this_cycle {
                    out.eprintln(format!("[MENTOR:MEMORY] {}", found.context));
                }
            }
        }
    }

    if (all || ctx.toggles.flag("mentor_analytics")) && started.elapsed() < MENTOR_BUDGET {
        let nudges = mentor_analytics::evaluate(call, state, ctx.now);
        if let Some(first) = nudges.first() {
            if !state.mentor_warned_this_cycle {
                out.eprintln(format!("[MENTOR:ANALYTICS] {}", first));
            }
        }
    }
}

/// One advisory per milestone hour
fn session_nudge(state: &mut SessionState, now: f64, out: &mut HookOutcome) {
    let hours = (now - state.session_start) / 3600.0;
    let last = state.session_duration_nudge_hour;
    let (milestone, advice) = if hours >= 3.0 && last < 3 {
        (3, "Session running 3h+. Save progress with /wrap-up before context degrades.")
    } else if hours >= 2.0 && last < 2 {
        (2, "Session running 2h+. Consider saving key findings to memory.")
    } else if hours >= 1.0 && last < 1 {
        (1, "Session running 1h+. Good time for a memory checkpoint.")
    } else {
        return;
    };
    state.session_duration_nudge_hour = milestone;
    out.eprintln(format!("[SESSION] ADVISORY: {}", advice));
}
