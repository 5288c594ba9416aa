//! TTL cache for non-blocking gate results.
//!
//! Retried tool calls skip re-evaluating gates that already passed. Blocks
//! and asks are never cached so the agent can fix the condition and retry.

use crate::config::CacheConfig;
use crate::events::{self, Event};
use crate::gate_result::GateResult;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Input fields that influence gate decisions, per tool
fn key_fields(tool_name: &str) -> &'static [&'static str] {
    match tool_name {
        "Edit" => &["file_path", "old_string"],
        "Write" => &["file_path"],
        "NotebookEdit" => &["notebook_path", "cell_number"],
        "Bash" => &["command"],
        "Task" => &["model", "subagent_type", "description"],
        "WebFetch" => &["url"],
        "WebSearch" => &["query"],
        _ => &["file_path", "command", "url", "query"],
    }
}

/// First 16 hex chars of SHA-256 over `[gate, tool, {fields}]`, keys sorted
pub fn cache_key(gate: &str, tool_name: &str, tool_input: &Map<String, Value>) -> String {
    let relevant: Map<String, Value> = key_fields(tool_name)
        .iter()
        .map(|k| {
            let v = tool_input
                .get(*k)
                .cloned()
                .unwrap_or_else(|| Value::String(String::new()));
            (k.to_string(), v)
        })
        .collect();
    let raw = Value::Array(vec![
        Value::String(gate.to_string()),
        Value::String(tool_name.to_string()),
        Value::Object(relevant),
    ])
    .to_string();
    let digest = Sha256::digest(raw.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

struct Entry {
    result: GateResult,
    stored_at: Instant,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    pub enabled: bool,
    pub ttl_s: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub cached: usize,
}

pub struct GateCache {
    enabled: bool,
    ttl: Duration,
    entries: DashMap<String, Entry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GateCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: Duration::from_secs(config.ttl_secs),
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached result within the TTL, or `None`
    pub fn get(
        &self,
        gate: &str,
        tool_name: &str,
        tool_input: &Map<String, Value>,
    ) -> Option<GateResult> {
        let found = self.lookup(gate, tool_name, tool_input);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        events::emit(Event::cache_lookup(gate, tool_name, found.is_some()));
        found
    }

    fn lookup(
        &self,
        gate: &str,
        tool_name: &str,
        tool_input: &Map<String, Value>,
    ) -> Option<GateResult> {
        if !self.enabled {
            return None;
        }
        let key = cache_key(gate, tool_name, tool_input);
        let expired = {
            let entry = self.entries.get(&key)?;
            if entry.stored_at.elapsed() < self.ttl {
                return Some(entry.result.clone());
            }
            true
        };
        if expired {
            self.entries.remove(&key);
        }
        None
    }

    /// Store a result unless it blocks or asks
    pub fn put(
        &self,
        gate: &str,
        tool_name: &str,
        tool_input: &Map<String, Value>,
        result: &GateResult,
    ) {
        if !self.enabled || result.blocked || result.is_ask() {
            return;
        }
        self.entries.insert(
            cache_key(gate, tool_name, tool_input),
            Entry {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            enabled: self.enabled,
            ttl_s: self.ttl.as_secs_f64(),
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            cached: self.entries.len(),
        }
    }
}
