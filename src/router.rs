//! Gate routing with Q-learning order.
//!
//! Tier 1 gates keep registry order and always run first. The remaining gates
//! are ordered by a learned per-tool value that rises when a gate blocks and
//! decays when it passes, so gates likely to block run early.

use crate::config::Paths;
use crate::events::{self, Event};
use crate::gate_result::{GateResult, Severity};
use crate::gates::{self, Gate, GateContext};
use crate::hook::ToolCall;
use crate::state::store::{read_json, write_json_atomic};
use crate::state::SessionState;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

pub const Q_ALPHA: f64 = 0.1;
pub const Q_REWARD_BLOCK: f64 = 1.0;
pub const Q_REWARD_PASS: f64 = -0.1;

/// gate module name → tool name → Q
pub type QTable = BTreeMap<String, BTreeMap<String, f64>>;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RoutingStats {
    pub calls: u64,
    pub gates_run: u64,
    pub gates_skipped: u64,
    pub tier1_blocks: u64,
    pub avg_routing_ms: f64,
    pub last_routing_ms: f64,
    pub skip_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    calls: u64,
    gates_run: u64,
    gates_skipped: u64,
    tier1_blocks: u64,
    total_ms: f64,
    last_ms: f64,
}

pub struct QRouter {
    path: PathBuf,
    table: Option<QTable>,
    dirty: bool,
    counters: Counters,
}

impl QRouter {
    pub fn new(paths: &Paths) -> Self {
        Self {
            path: paths.qtable_file(),
            table: None,
            dirty: false,
            counters: Counters::default(),
        }
    }

    fn table(&mut self) -> &mut QTable {
        let path = &self.path;
        self.table.get_or_insert_with(|| {
            read_json(path)
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default()
        })
    }

    pub fn q_value(&mut self, gate_module: &str, tool_name: &str) -> f64 {
        self.table()
            .get(gate_module)
            .and_then(|tools| tools.get(tool_name))
            .copied()
            .unwrap_or(0.0)
    }

    /// Tier 1 first in given order, then the rest by descending Q (stable)
    pub fn order<'g>(&mut self, tool_name: &str, gates: Vec<&'g dyn Gate>) -> Vec<&'g dyn Gate> {
        let (mut ordered, rest): (Vec<_>, Vec<_>) =
            gates.into_iter().partition(|g| g.id().is_tier1());
        let mut scored: Vec<(f64, &'g dyn Gate)> = rest
            .into_iter()
            .map(|g| (self.q_value(g.id().module_name(), tool_name), g))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        ordered.extend(scored.into_iter().map(|(_, g)| g));
        ordered
    }

    /// `Q ← Q + α(r − Q)`; persisted on [`QRouter::flush`]
    pub fn update(&mut self, gate_module: &str, tool_name: &str, blocked: bool) {
        let reward = if blocked { Q_REWARD_BLOCK } else { Q_REWARD_PASS };
        let entry = self
            .table()
            .entry(gate_module.to_string())
            .or_default()
            .entry(tool_name.to_string())
            .or_insert(0.0);
        *entry += Q_ALPHA * (reward - *entry);
        self.dirty = true;
    }

    /// Write the table if anything changed. Failures are logged, not raised.
    pub fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some(table) = &self.table {
            if let Err(e) = write_json_atomic(&self.path, table) {
                tracing::warn!(error = %e, "failed to persist gate Q-table");
                return;
            }
        }
        self.dirty = false;
    }

    /// Drop the in-memory table so the next lookup rereads the file
    pub fn reload(&mut self) {
        if !self.dirty {
            self.table = None;
        }
    }

    pub fn table_snapshot(&mut self) -> QTable {
        self.table().clone()
    }

    /// Run every gate watching the call in priority order.
    ///
    /// Stops after a Tier 1 block or ask. A crashing Tier 1 gate yields a
    /// critical block; any other crash yields a warning.
    pub fn route_gates(
        &mut self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Vec<GateResult> {
        let started = Instant::now();
        self.counters.calls += 1;

        let applicable = gates::gates_for_tool(&call.tool_name);
        let total = applicable.len() as u64;
        let mut results = Vec::new();

        for gate in applicable {
            let id = gate.id();
            let gate_started = Instant::now();
            let result = match gates::run_gate(gate, call, state, ctx) {
                Ok(mut result) => {
                    result.duration_ms = Some(gate_started.elapsed().as_secs_f64() * 1000.0);
                    result
                }
                Err(e) => crash_result(gate, &e),
            };
            let halt = id.is_tier1() && (result.blocked || result.is_ask());
            results.push(result);
            if halt {
                self.counters.tier1_blocks += 1;
                break;
            }
        }

        let run = results.len() as u64;
        self.counters.gates_run += run;
        self.counters.gates_skipped += total - run;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.counters.total_ms += elapsed_ms;
        self.counters.last_ms = elapsed_ms;
        events::emit(Event::gates_routed(&call.tool_name, run as u32, elapsed_ms));
        results
    }

    pub fn stats(&self) -> RoutingStats {
        let c = &self.counters;
        let considered = c.gates_run + c.gates_skipped;
        RoutingStats {
            calls: c.calls,
            gates_run: c.gates_run,
            gates_skipped: c.gates_skipped,
            tier1_blocks: c.tier1_blocks,
            avg_routing_ms: if c.calls > 0 {
                round_to(c.total_ms / c.calls as f64, 3)
            } else {
                0.0
            },
            last_routing_ms: round_to(c.last_ms, 3),
            skip_rate: if considered > 0 {
                round_to(c.gates_skipped as f64 / considered as f64, 4)
            } else {
                0.0
            },
        }
    }
}

fn crash_result(gate: &dyn Gate, e: &anyhow::Error) -> GateResult {
    let id = gate.id();
    if id.is_tier1() {
        GateResult::block(
            id.module_name(),
            format!("[gate_router] Tier 1 gate '{}' crashed: {}", id.module_name(), e),
        )
        .with_severity(Severity::Critical)
    } else {
        GateResult::warn(
            id.module_name(),
            format!(
                "[gate_router] Gate '{}' crashed (non-fatal): {}",
                id.module_name(),
                e
            ),
        )
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Persisted Q-table, for reporting
pub fn load_qtable(paths: &Paths) -> Result<QTable> {
    Ok(read_json(&paths.qtable_file())
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default())
}
