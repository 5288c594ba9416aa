//! PreToolUse dispatcher.
//!
//! Parses the hook payload, loads session state and runs every gate watching
//! the tool in routed order. Tier 1 gates fail closed: their crashes block.
//! Every other gate fails open. The result is a [`HookOutcome`]; callers
//! decide how to render it.

use crate::audit::{AuditEntry, AuditLog, Decision};
use crate::breaker::GateBreaker;
use crate::cache::GateCache;
use crate::config::{Config, Paths, Toggles};
use crate::events::{self, Event};
use crate::gate_result::{GateResult, Severity};
use crate::gates::{self, Gate, GateContext, GateId};
use crate::hook::{truncate_chars, HookEvent, HookInput, HookOutcome, ToolCall};
use crate::metrics;
use crate::profiles::{GateMode, SecurityProfile};
use crate::router::{QRouter, RoutingStats};
use crate::state::effectiveness::{update_gate_effectiveness, EffectivenessField};
use crate::state::sideband::write_memory_sideband;
use crate::state::store::{load_state, save_state};
use crate::state::{now_secs, BlockOutcome, SessionState};
use std::time::Instant;

/// Tools that never go through the gate pipeline
pub const ALWAYS_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Glob",
    "Grep",
    "WebFetch",
    "WebSearch",
    "AskUserQuestion",
    "EnterPlanMode",
    "ExitPlanMode",
    "TaskCreate",
    "TaskUpdate",
    "TaskList",
    "TaskGet",
    "TeamCreate",
    "TeamDelete",
    "SendMessage",
    "TaskStop",
];

const MEMORY_TOOL_PREFIXES: &[&str] = &["mcp__memory__", "mcp_memory_"];
const ANALYTICS_TOOL_PREFIX: &str = "mcp__analytics__";

/// Always-allowed tools that still get the injection scan
const INJECTION_SCAN_TOOLS: &[&str] = &["WebFetch", "WebSearch"];

/// Tools that must carry a non-empty input
const INPUT_REQUIRED_TOOLS: &[&str] = &["Bash", "Edit", "Write", "NotebookEdit"];

const SLOW_GATE_MS: f64 = 100.0;
const MAX_BLOCK_OUTCOMES: usize = 100;

pub fn is_memory_tool(tool_name: &str) -> bool {
    MEMORY_TOOL_PREFIXES.iter().any(|p| tool_name.starts_with(p))
}

pub fn is_analytics_tool(tool_name: &str) -> bool {
    tool_name.starts_with(ANALYTICS_TOOL_PREFIX)
}

pub fn is_always_allowed(tool_name: &str) -> bool {
    ALWAYS_ALLOWED_TOOLS.contains(&tool_name)
        || is_memory_tool(tool_name)
        || is_analytics_tool(tool_name)
}

/// Subagent sessions look like UUIDs: eight lowercase hex chars then `-`
pub fn is_subagent_session(session_id: &str) -> bool {
    let bytes = session_id.as_bytes();
    bytes.len() > 8
        && bytes[8] == b'-'
        && bytes[..8]
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
}

pub struct Enforcer {
    paths: Paths,
    cache: GateCache,
    router: QRouter,
    audit: AuditLog,
    breaker: GateBreaker,
}

impl Enforcer {
    pub fn new(config: &Config) -> Self {
        Self::with_paths(config, config.paths())
    }

    pub fn with_paths(config: &Config, paths: Paths) -> Self {
        Self {
            cache: GateCache::new(&config.cache),
            router: QRouter::new(&paths),
            audit: AuditLog::new(&paths, &config.audit),
            breaker: GateBreaker::new(&paths),
            paths,
        }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn cache(&self) -> &GateCache {
        &self.cache
    }

    pub fn routing_stats(&self) -> RoutingStats {
        self.router.stats()
    }

    /// Forget cached results and the in-memory Q-table; the daemon calls
    /// this before each request so it behaves like a fresh process
    pub fn reset_for_request(&mut self) {
        self.cache.clear();
        self.router.reload();
    }

    /// Full hook flow from the raw stdin text
    pub fn handle_raw(&mut self, raw: &str) -> HookOutcome {
        self.handle_raw_at(raw, now_secs())
    }

    pub fn handle_raw_at(&mut self, raw: &str, now: f64) -> HookOutcome {
        match HookInput::parse(raw) {
            Ok(input) => self.handle_at(input, now),
            Err(e) => {
                tracing::debug!(error = %e, "unparseable hook input");
                HookOutcome::block("[ENFORCER] BLOCKED: Malformed or missing JSON input")
            }
        }
    }

    pub fn handle(&mut self, input: HookInput) -> HookOutcome {
        self.handle_at(input, now_secs())
    }

    pub fn handle_at(&mut self, input: HookInput, now: f64) -> HookOutcome {
        if let Err(e) = gates::verify_registry() {
            return HookOutcome::block(format!("[ENFORCER] BLOCKED: {}", e));
        }
        if input.tool_name.is_empty() {
            return HookOutcome::block("[ENFORCER] BLOCKED: Missing or empty tool_name");
        }
        if INPUT_REQUIRED_TOOLS.contains(&input.tool_name.as_str()) && input.tool_input_is_empty()
        {
            return HookOutcome::block(format!(
                "[ENFORCER] BLOCKED: Missing or empty tool_input for {}",
                input.tool_name
            ));
        }

        let session_id = input.session_id.clone();
        let mut state = load_state(&self.paths, &session_id);
        state.session_id = session_id.clone();

        if !state.sideband_refreshed && is_subagent_session(&session_id) {
            if let Err(e) = write_memory_sideband(&self.paths, now) {
                tracing::debug!(error = %e, "subagent sideband refresh failed");
            }
            state.sideband_refreshed = true;
            self.save(&mut state);
        }

        let toggles = Toggles::load(&self.paths);
        if let Some(profile) = toggles.string("security_profile") {
            state.security_profile = profile;
        }

        let call = ToolCall::new(&input.tool_name, &input.tool_input, HookEvent::PreToolUse);
        // Owned copy so the context doesn't hold a borrow of `self`
        let paths = self.paths.clone();
        let ctx = GateContext::new(&paths, &toggles, now);

        if is_always_allowed(&call.tool_name) {
            if INJECTION_SCAN_TOOLS.contains(&call.tool_name.as_str()) {
                return self.scan_injection(&call, &mut state, &ctx);
            }
            return HookOutcome::allow();
        }

        self.run_gates(&call, &mut state, &ctx)
    }

    /// Web tools skip the pipeline but still get the injection scan
    fn scan_injection(
        &mut self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> HookOutcome {
        let Some(gate) = gates::gate(GateId::InjectionDefense) else {
            return HookOutcome::allow();
        };
        let outcome = match gates::run_gate(gate, call, state, ctx) {
            Ok(result) if result.blocked => HookOutcome::block(result.message),
            Ok(_) => HookOutcome::allow(),
            Err(e) => {
                let mut outcome = HookOutcome::allow();
                outcome.eprintln(format!("[ENFORCER] G17 scan error: {}", e));
                outcome
            }
        };
        self.save(state);
        outcome
    }

    fn run_gates(
        &mut self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> HookOutcome {
        let tool = call.tool_name.as_str();
        let profile = SecurityProfile::parse(&state.security_profile);
        let ordered = self.router.order(tool, gates::gates_for_tool(tool));
        let session_id = state.session_id.clone();
        let mut outcome = HookOutcome::allow();
        let mut passed: Vec<GateId> = Vec::new();

        for gate in ordered {
            let id = gate.id();
            let module = id.module_name();
            let label = id.label();

            let mode = profile.gate_mode(id);
            if mode == GateMode::Disabled {
                continue;
            }
            if self.breaker.should_skip(module, id.is_tier1(), ctx.now) {
                tracing::debug!(gate = %label, tool = %tool, "gate circuit open, skipping");
                continue;
            }

            let (result, elapsed_ms) = match self.evaluate(gate, call, state, ctx) {
                Ok(evaluated) => evaluated,
                Err(e) => {
                    self.breaker.record(module, id.is_tier1(), false, ctx.now);
                    events::emit(Event::gate_crashed(label, tool, id.tier(), &e.to_string()));
                    let audit = AuditEntry::new(label, tool, Decision::Block, format!("crash: {}", e))
                        .session(&session_id)
                        .state_keys(id.state_reads());
                    if id.is_tier1() {
                        self.audit.record(audit.severity(Severity::Error));
                        tracing::error!(gate = %label, tool = %tool, error = %e, "tier 1 gate crashed");
                        outcome.exit_code = 2;
                        outcome.eprintln(format!(
                            "[ENFORCER] BLOCKED: Tier 1 safety gate '{}' crashed: {}",
                            label, e
                        ));
                        self.finish(state);
                        return outcome;
                    }
                    let mut crash = audit.severity(Severity::Warn);
                    crash.decision = Decision::Crash.as_str().to_string();
                    self.audit.record(crash);
                    tracing::warn!(gate = %label, tool = %tool, error = %e, "gate crashed");
                    outcome.eprintln(format!("[ENFORCER] Warning: Gate error in {}: {}", label, e));
                    continue;
                }
            };

            state.gate_timing_stats.entry(module.to_string()).or_default().record(elapsed_ms);
            if elapsed_ms > SLOW_GATE_MS {
                events::emit(Event::gate_slow(label, tool, elapsed_ms));
                self.audit.record(
                    AuditEntry::new(
                        label,
                        tool,
                        Decision::Slow,
                        format!("gate took {:.0}ms (>100ms threshold)", elapsed_ms),
                    )
                    .session(&session_id)
                    .state_keys(id.state_reads())
                    .severity(Severity::Warn),
                );
            }

            let entry = |decision: Decision, reason: &str| {
                AuditEntry::new(label, tool, decision, reason)
                    .session(&session_id)
                    .state_keys(id.state_reads())
                    .file_path(call.primary_path())
            };

            if result.is_ask() {
                self.audit.record(entry(Decision::Ask, &result.message).severity(result.severity));
                emit_decision(&session_id, label, tool, "ask", result.severity, elapsed_ms);
                if let Some(decision) = result.to_hook_decision() {
                    outcome.println(decision.to_string());
                }
                self.router.update(module, tool, true);
                self.finish(state);
                return outcome;
            }

            if result.blocked && mode == GateMode::Warn && !id.is_tier1() {
                let reason = format!("[profile:downgraded] {}", result.message);
                self.audit.record(entry(Decision::Warn, &reason).severity(Severity::Warn));
                emit_decision(&session_id, label, tool, "warn", Severity::Warn, elapsed_ms);
                passed.push(id);
                continue;
            }

            if result.blocked {
                self.audit.record(entry(Decision::Block, &result.message).severity(result.severity));
                emit_decision(&session_id, label, tool, "block", result.severity, elapsed_ms);
                tracing::info!(gate = %label, tool = %tool, "gate blocked tool call");
                record_block(state, module, call, ctx.now);
                if let Err(e) = update_gate_effectiveness(&self.paths, module, EffectivenessField::Blocks) {
                    tracing::warn!(gate = %label, error = %e, "failed to update gate effectiveness");
                }
                self.router.update(module, tool, true);
                outcome.exit_code = 2;
                outcome.eprintln(result.message);
                self.finish(state);
                return outcome;
            }

            if !result.message.is_empty() {
                self.audit.record(entry(Decision::Warn, &result.message).severity(Severity::Warn));
                emit_decision(&session_id, label, tool, "warn", Severity::Warn, elapsed_ms);
                outcome.eprintln(result.message);
            } else {
                self.audit.record(entry(Decision::Pass, "").severity(Severity::Info));
                emit_decision(&session_id, label, tool, "pass", Severity::Info, elapsed_ms);
            }
            passed.push(id);
        }

        for id in passed {
            self.router.update(id.module_name(), tool, false);
        }
        self.finish(state);
        outcome
    }

    /// Cached result or a fresh run, with its duration in ms
    fn evaluate(
        &self,
        gate: &dyn Gate,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> anyhow::Result<(GateResult, f64)> {
        let id = gate.id();
        if let Some(cached) = self.cache.get(id.short_name(), &call.tool_name, &call.tool_input) {
            self.breaker.record(id.module_name(), id.is_tier1(), true, ctx.now);
            return Ok((cached, 0.0));
        }
        let started = Instant::now();
        let mut result = gates::run_gate(gate, call, state, ctx)?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        result.duration_ms = Some(elapsed_ms);
        self.breaker.record(id.module_name(), id.is_tier1(), true, ctx.now);
        self.cache.put(id.short_name(), &call.tool_name, &call.tool_input, &result);
        Ok((result, elapsed_ms))
    }

    /// Persist the Q-table, metrics and state. Failures are logged only.
    fn finish(&mut self, state: &mut SessionState) {
        self.router.flush();
        if let Err(e) = metrics::global().flush_to(&self.paths.metrics_file()) {
            tracing::debug!(error = %e, "metrics flush failed");
        }
        self.save(state);
    }

    fn save(&self, state: &mut SessionState) {
        let session_id = state.session_id_or_main().to_string();
        if let Err(e) = save_state(&self.paths, state, &session_id) {
            tracing::warn!(session = %session_id, error = %e, "failed to save session state");
        }
    }
}

fn emit_decision(
    session_id: &str,
    gate: &str,
    tool: &str,
    decision: &str,
    severity: Severity,
    duration_ms: f64,
) {
    events::emit(Event::gate_decision(
        session_id,
        gate,
        tool,
        decision,
        severity.as_str(),
        duration_ms,
    ));
}

/// Count the block and queue it for resolution by the tracker
fn record_block(state: &mut SessionState, module: &str, call: &ToolCall, now: f64) {
    *state.gate_block_counts.entry(module.to_string()).or_insert(0) += 1;
    let file = match call.target_path() {
        "" => truncate_chars(call.command(), 100),
        path => path,
    };
    state.gate_block_outcomes.push(BlockOutcome {
        gate: module.to_string(),
        tool: call.tool_name.clone(),
        file: file.to_string(),
        timestamp: now,
        resolved_by: None,
    });
    let excess = state.gate_block_outcomes.len().saturating_sub(MAX_BLOCK_OUTCOMES);
    state.gate_block_outcomes.drain(..excess);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::AuditConfig;
    use crate::gates::test_support::Fixture;
    use serde_json::json;

    const NOW: f64 = 1_700_000_000.0;

    fn enforcer(fx: &Fixture) -> Enforcer {
        Enforcer::with_paths(&Config::default(), fx.paths.clone())
    }

    fn run(fx: &Fixture, payload: serde_json::Value) -> HookOutcome {
        enforcer(fx).handle_raw_at(&payload.to_string(), NOW)
    }

    #[test]
    fn test_malformed_input_fails_closed() {
        let fx = Fixture::new();
        let outcome = enforcer(&fx).handle_raw_at("{not json", NOW);
        assert_eq!(outcome.exit_code, 2);
        assert_eq!(outcome.stderr, "[ENFORCER] BLOCKED: Malformed or missing JSON input\n");

        let outcome = run(&fx, json!({"tool_input": {"command": "ls"}}));
        assert!(outcome.stderr.contains("Missing or empty tool_name"));

        let outcome = run(&fx, json!({"tool_name": "Bash", "tool_input": {}}));
        assert_eq!(outcome.exit_code, 2);
        assert!(outcome.stderr.contains("Missing or empty tool_input for Bash"));
    }

    #[test]
    fn test_always_allowed_tools() {
        let fx = Fixture::new();
        for tool in ["Read", "Grep", "mcp__memory__search_knowledge", "mcp__analytics__usage"] {
            let outcome = run(&fx, json!({"tool_name": tool, "tool_input": {"file_path": "/x"}}));
            assert_eq!(outcome, HookOutcome::allow(), "{}", tool);
        }
        assert!(!fx.paths.state_file("main").exists());
    }

    #[test]
    fn test_web_tools_get_injection_scan() {
        let fx = Fixture::new();
        let outcome = run(
            &fx,
            json!({"tool_name": "WebFetch", "tool_input": {"url": "https://x.io/<script>alert(1)</script>"}}),
        );
        assert_eq!(outcome.exit_code, 2);
        assert!(outcome.stderr.contains("GATE 17: INJECTION DEFENSE"));
        let state = load_state(&fx.paths, "main");
        assert_eq!(state.injection_attempts, 1);

        let outcome = run(&fx, json!({"tool_name": "WebSearch", "tool_input": {"query": "rust regex crate"}}));
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn test_tier1_block_records_outcome() {
        let fx = Fixture::new();
        let outcome = run(
            &fx,
            json!({"tool_name": "Edit", "session_id": "s1", "tool_input": {"file_path": "/p/app.py", "old_string": "a", "new_string": "b"}}),
        );
        assert_eq!(outcome.exit_code, 2);
        assert!(outcome.stderr.contains("GATE 1: READ BEFORE EDIT"));

        let state = load_state(&fx.paths, "s1");
        assert_eq!(state.gate_block_counts.get("gate_01_read_before_edit"), Some(&1));
        let block = &state.gate_block_outcomes[0];
        assert_eq!(block.file, "/p/app.py");
        assert_eq!(block.tool, "Edit");
        assert!(block.resolved_by.is_none());

        let audit = AuditLog::new(&fx.paths, &AuditConfig::default());
        let recent = audit.recent_decisions(Some("GATE 1: READ BEFORE EDIT"), 5);
        assert_eq!(recent[0].decision, "block");
        assert_eq!(recent[0].session_id, "s1");
    }

    #[test]
    fn test_destructive_bash_blocked() {
        let fx = Fixture::new();
        let outcome = run(&fx, json!({"tool_name": "Bash", "tool_input": {"command": "rm -rf /"}}));
        assert_eq!(outcome.exit_code, 2);
        assert!(outcome.stderr.contains("GATE 2: NO DESTROY"));
        let state = load_state(&fx.paths, "main");
        assert_eq!(state.gate_block_outcomes[0].file, "rm -rf /");
    }

    fn read_then_edit(fx: &Fixture) -> HookOutcome {
        let mut state = SessionState::new_at(NOW - 60.0);
        state.files_read.push("/p/app.py".into());
        save_state(&fx.paths, &mut state, "main").unwrap();
        run(
            fx,
            json!({"tool_name": "Edit", "tool_input": {"file_path": "/p/app.py", "old_string": "a", "new_string": "x = 1"}}),
        )
    }

    #[test]
    fn test_memory_first_blocks_under_balanced() {
        let fx = Fixture::new();
        let outcome = read_then_edit(&fx);
        assert_eq!(outcome.exit_code, 2);
        assert!(outcome.stderr.contains("GATE 4: MEMORY FIRST"));
    }

    #[test]
    fn test_permissive_profile_downgrades_blocks() {
        let fx = Fixture::new();
        let toggles = fx.paths.toggles_file();
        std::fs::create_dir_all(toggles.parent().unwrap()).unwrap();
        std::fs::write(&toggles, json!({"security_profile": "permissive"}).to_string()).unwrap();

        let outcome = read_then_edit(&fx);
        assert_eq!(outcome.exit_code, 0, "{}", outcome.stderr);
        let state = load_state(&fx.paths, "main");
        assert_eq!(state.security_profile, "permissive");
        assert!(state.gate_block_counts.is_empty());
        assert!(state.gate_timing_stats.contains_key("gate_04_memory_first"));

        let audit = AuditLog::new(&fx.paths, &AuditConfig::default());
        let recent = audit.recent_decisions(Some("GATE 4: MEMORY FIRST"), 1);
        assert!(recent[0].reason.starts_with("[profile:downgraded]"));
    }

    #[test]
    fn test_subagent_mini_boot() {
        assert!(is_subagent_session("1a2b3c4d-0000-4000-8000-000000000000"));
        assert!(!is_subagent_session("1A2B3C4D-0000"));
        assert!(!is_subagent_session("main"));
        assert!(!is_subagent_session("12345678"));

        let fx = Fixture::new();
        let session = "deadbeef-1111-2222-3333-444444444444";
        run(&fx, json!({"tool_name": "Read", "session_id": session, "tool_input": {"file_path": "/x"}}));
        assert!(fx.paths.memory_sideband().exists());
        assert!(load_state(&fx.paths, session).sideband_refreshed);
    }
}
