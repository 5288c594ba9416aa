//! Gate 9: strategy ban.
//!
//! A fix strategy that keeps failing is banned. The first failures only
//! warn; at the threshold the edit is blocked and the strategy is deferred as
//! technical debt, both in state and in the active PRP's `deferred.md`.

use super::{Gate, GateContext, GateId};
use crate::gate_result::{GateResult, Severity};
use crate::hook::{truncate_chars, ToolCall};
use crate::state::{DeferredItem, SessionState};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_BAN_THRESHOLD: u32 = 3;
const SUCCESS_BONUS_RETRIES: u32 = 1;
const MAX_DEFERRED_ITEMS: usize = 50;

fn ban_severity(fail_count: u32) -> (&'static str, Severity) {
    match fail_count {
        c if c >= 3 => ("escalating", Severity::Critical),
        2 => ("repeating", Severity::Error),
        _ => ("first_fail", Severity::Warn),
    }
}

/// Name of the first PRP whose task list has an in-progress task
fn active_prp(prps_dir: &Path) -> Option<String> {
    let pattern = prps_dir.join("*.tasks.json");
    let mut files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .ok()?
        .filter_map(|p| p.ok())
        .collect();
    files.sort();
    files.into_iter().find_map(|file| {
        let raw = std::fs::read_to_string(&file).ok()?;
        let data: Value = serde_json::from_str(&raw).ok()?;
        let in_progress = data
            .get("tasks")?
            .as_array()?
            .iter()
            .any(|t| t.get("status").and_then(Value::as_str) == Some("in_progress"));
        if !in_progress {
            return None;
        }
        let name = file.file_name()?.to_string_lossy();
        Some(name.trim_end_matches(".tasks.json").to_string())
    })
}

fn append_deferred_markdown(prps_dir: &Path, prp: &str, item: &DeferredItem) -> Result<()> {
    let path = prps_dir.join(format!("{}.deferred.md", prp));
    let header_needed = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut entry = String::new();
    if header_needed {
        entry.push_str(&format!("# Deferred Items: {}\n\n", prp));
    }
    entry.push_str(&format!(
        "### {} - Strategy `{}` banned\n- **Error**: {}\n- **File**: {}\n- **Failures**: {}\n- **Action needed**: Try different approach or escalate to human review\n\n",
        item.deferred_at,
        item.strategy,
        truncate_chars(&item.error_signature, 200),
        item.file,
        item.fail_count
    ));
    file.write_all(entry.as_bytes())?;
    Ok(())
}

fn local_timestamp(now: f64) -> String {
    DateTime::<Utc>::from_timestamp(now as i64, 0)
        .unwrap_or_default()
        .with_timezone(&Local)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

fn minutes_since(now: f64, then: f64) -> i64 {
    if then > 0.0 {
        ((now - then) / 60.0) as i64
    } else {
        0
    }
}

pub struct StrategyBan;

impl Gate for StrategyBan {
    fn id(&self) -> GateId {
        GateId::StrategyBan
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || !call.is_edit_tool() || state.current_strategy_id.is_empty() {
            return Ok(GateResult::pass(name));
        }
        let strategy = state.current_strategy_id.clone();
        let Some(ban) = state.active_bans.get(&strategy).cloned() else {
            return Ok(GateResult::pass(name));
        };

        let success_count = state
            .successful_strategies
            .get(&strategy)
            .map(|s| s.success_count)
            .unwrap_or(0);
        let threshold = if success_count > 0 {
            DEFAULT_BAN_THRESHOLD + SUCCESS_BONUS_RETRIES
        } else {
            DEFAULT_BAN_THRESHOLD
        };

        if ban.fail_count >= threshold {
            let (level, severity) = ban_severity(ban.fail_count);
            let file = match call.input_str("file_path") {
                "" => call.input_str("path"),
                f => f,
            };
            let item = DeferredItem {
                strategy: strategy.clone(),
                error_signature: if state.current_error_signature.is_empty() {
                    "unknown".to_string()
                } else {
                    state.current_error_signature.clone()
                },
                fail_count: ban.fail_count,
                file: file.to_string(),
                deferred_at: local_timestamp(ctx.now),
            };
            let prps_dir = ctx.paths.prps_dir();
            if let Some(prp) = active_prp(&prps_dir) {
                if let Err(e) = append_deferred_markdown(&prps_dir, &prp, &item) {
                    tracing::warn!(prp = %prp, error = %e, "failed to record deferred item");
                }
            }
            state.deferred_items.push(item);
            if state.deferred_items.len() > MAX_DEFERRED_ITEMS {
                let excess = state.deferred_items.len() - MAX_DEFERRED_ITEMS;
                state.deferred_items.drain(..excess);
            }

            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED + DEFERRED ({}): Strategy '{}' is BANNED ({} failures, threshold={}). first: {}m ago, last: {}m ago. Call record_attempt() with a NEW strategy_id, or record_outcome() to close the current chain. Use query_fix_history() to see what's been tried.",
                    name,
                    level,
                    strategy,
                    ban.fail_count,
                    threshold,
                    minutes_since(ctx.now, ban.first_failed),
                    minutes_since(ctx.now, ban.last_failed)
                ),
            )
            .with_severity(severity));
        }

        if ban.fail_count >= 1 {
            let success_context = if success_count > 0 {
                format!(" (past successes: {})", success_count)
            } else {
                String::new()
            };
            return Ok(GateResult::warn(
                name,
                format!(
                    "[{}] WARNING: Strategy '{}' has failed {}/{} times{}. {} more failure(s) before ban. Consider a different approach.",
                    name,
                    strategy,
                    ban.fail_count,
                    threshold,
                    success_context,
                    threshold - ban.fail_count
                ),
            ));
        }

        Ok(GateResult::pass(name))
    }
}
