//! Gate pipeline metrics.
//!
//! Provides Prometheus-compatible metrics and a JSON snapshot for:
//! - Gate decisions by gate/decision
//! - Gate latency histograms
//! - Circuit breaker trips
//! - Gate cache hits and misses
//! - Daemon requests
//!
//! The collector listens on the [`crate::events`] bus. Hook processes are
//! short-lived, so the JSON side accumulates across processes: each process
//! merges what it counted into `metrics.json` via [`MetricsCollector::flush_to`].

use crate::events::{Event, EventBus, EventType};
use crate::state::store::{lock_path_for, read_json, write_json_atomic, FileLock};
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

const GATE_LABEL: &str = "gate";
const DECISION_LABEL: &str = "decision";
const NAME_LABEL: &str = "name";
const RESULT_LABEL: &str = "result";
const EXIT_LABEL: &str = "exit_code";

/// Metrics collector for the gate pipeline
pub struct MetricsCollector {
    registry: Registry,

    /// Gate decisions by gate and decision
    gate_decisions_total: CounterVec,

    /// Gate check duration in milliseconds
    gate_duration_ms: HistogramVec,

    /// Circuit breaker trips by breaker name
    circuit_trips_total: CounterVec,

    /// Cache lookups by result (hit/miss)
    cache_lookups_total: CounterVec,

    /// Daemon requests by exit code
    daemon_requests_total: CounterVec,

    /// JSON data accumulated since the last flush
    json_data: Arc<RwLock<MetricsSnapshot>>,
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let vec = CounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|e| panic!("invalid counter {}: {}", name, e));
    // Fresh registry per collector, so registration only fails on a name clash
    let _ = registry.register(Box::new(vec.clone()));
    vec
}

impl MetricsCollector {
    pub fn new() -> Self {
        let registry = Registry::new();

        let gate_decisions_total = counter(
            &registry,
            "torus_gate_decisions_total",
            "Gate decisions",
            &[GATE_LABEL, DECISION_LABEL],
        );

        let duration_opts =
            HistogramOpts::new("torus_gate_duration_ms", "Gate check duration in milliseconds")
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]);
        let gate_duration_ms = HistogramVec::new(duration_opts, &[GATE_LABEL])
            .unwrap_or_else(|e| panic!("invalid histogram: {}", e));
        let _ = registry.register(Box::new(gate_duration_ms.clone()));

        let circuit_trips_total = counter(
            &registry,
            "torus_circuit_trips_total",
            "Circuit breaker trips",
            &[NAME_LABEL],
        );
        let cache_lookups_total = counter(
            &registry,
            "torus_cache_lookups_total",
            "Gate cache lookups",
            &[RESULT_LABEL],
        );
        let daemon_requests_total = counter(
            &registry,
            "torus_daemon_requests_total",
            "Requests served by the enforcer daemon",
            &[EXIT_LABEL],
        );

        Self {
            registry,
            gate_decisions_total,
            gate_duration_ms,
            circuit_trips_total,
            cache_lookups_total,
            daemon_requests_total,
            json_data: Arc::new(RwLock::new(MetricsSnapshot::default())),
        }
    }

    fn with_data(&self, f: impl FnOnce(&mut MetricsSnapshot)) {
        let mut data = self.json_data.write().unwrap_or_else(|e| e.into_inner());
        f(&mut data);
    }

    /// Record one gate decision
    pub fn record_gate_decision(&self, gate: &str, decision: &str, duration_ms: f64) {
        self.gate_decisions_total
            .with_label_values(&[gate, decision])
            .inc();
        self.gate_duration_ms
            .with_label_values(&[gate])
            .observe(duration_ms);

        self.with_data(|data| {
            *data
                .gate_decisions
                .entry(gate.to_string())
                .or_default()
                .entry(decision.to_string())
                .or_default() += 1;
            let timing = data.gate_timing.entry(gate.to_string()).or_default();
            timing.count += 1;
            timing.total_ms += duration_ms;
        });
    }

    pub fn record_gate_crash(&self, gate: &str) {
        self.with_data(|data| {
            *data.gate_crashes.entry(gate.to_string()).or_default() += 1;
        });
    }

    pub fn record_slow_gate(&self) {
        self.with_data(|data| data.slow_gates += 1);
    }

    pub fn record_circuit_trip(&self, name: &str) {
        self.circuit_trips_total.with_label_values(&[name]).inc();
        self.with_data(|data| {
            data.circuit_trips += 1;
            *data.circuit_trips_by_name.entry(name.to_string()).or_default() += 1;
        });
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[result]).inc();
        self.with_data(|data| {
            if hit {
                data.cache_hits += 1;
            } else {
                data.cache_misses += 1;
            }
        });
    }

    pub fn record_daemon_request(&self, exit_code: i32) {
        let code = exit_code.to_string();
        self.daemon_requests_total
            .with_label_values(&[code.as_str()])
            .inc();
        self.with_data(|data| data.daemon_requests += 1);
    }

    pub fn record_memory_request(&self, ok: bool) {
        self.with_data(|data| {
            data.memory_requests += 1;
            if !ok {
                data.memory_failures += 1;
            }
        });
    }

    pub fn record_mentor_verdict(&self, verdict: &str) {
        self.with_data(|data| {
            *data.mentor_verdicts.entry(verdict.to_string()).or_default() += 1;
        });
    }

    /// Route an event to the matching counter
    pub fn observe(&self, event: &Event) {
        match &event.event_type {
            EventType::GateDecision {
                gate,
                decision,
                duration_ms,
                ..
            } => self.record_gate_decision(gate, decision, *duration_ms),
            EventType::GateSlow { .. } => self.record_slow_gate(),
            EventType::GateCrashed { gate, .. } => self.record_gate_crash(gate),
            EventType::CircuitOpened { name, .. } => self.record_circuit_trip(name),
            EventType::CacheLookup { hit, .. } => self.record_cache_lookup(*hit),
            EventType::DaemonRequest { exit_code, .. } => self.record_daemon_request(*exit_code),
            EventType::MemoryRequest { ok, .. } => self.record_memory_request(*ok),
            EventType::MentorVerdict { verdict, .. } => self.record_mentor_verdict(verdict),
            _ => {}
        }
    }

    /// Load accumulated counts into the Prometheus counters, so a fresh
    /// process can render what earlier processes flushed. Latency histograms
    /// are not replayed.
    pub fn replay(&self, snapshot: &MetricsSnapshot) {
        for (gate, decisions) in &snapshot.gate_decisions {
            for (decision, n) in decisions {
                self.gate_decisions_total
                    .with_label_values(&[gate.as_str(), decision.as_str()])
                    .inc_by(*n as f64);
            }
        }
        for (name, n) in &snapshot.circuit_trips_by_name {
            self.circuit_trips_total
                .with_label_values(&[name.as_str()])
                .inc_by(*n as f64);
        }
        self.cache_lookups_total
            .with_label_values(&["hit"])
            .inc_by(snapshot.cache_hits as f64);
        self.cache_lookups_total
            .with_label_values(&["miss"])
            .inc_by(snapshot.cache_misses as f64);
        if snapshot.daemon_requests > 0 {
            self.daemon_requests_total
                .with_label_values(&["any"])
                .inc_by(snapshot.daemon_requests as f64);
        }
    }

    /// Get Prometheus-formatted metrics
    pub fn prometheus_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Metrics counted since the last flush
    pub fn json_snapshot(&self) -> MetricsSnapshot {
        self.json_data
            .read()
            .map(|d| d.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Merge everything counted since the last flush into the JSON file at `path`
    pub fn flush_to(&self, path: &Path) -> anyhow::Result<()> {
        let pending = {
            let mut data = self.json_data.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *data)
        };
        if pending.is_empty() {
            return Ok(());
        }
        let _lock = FileLock::exclusive(&lock_path_for(path))?;
        let mut total = load_snapshot(path);
        total.merge(&pending);
        write_json_atomic(path, &total.with_timestamp())
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulated gate timing for JSON export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateTiming {
    pub count: u64,
    pub total_ms: f64,
}

/// Snapshot of metrics for JSON export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSnapshot {
    /// Timestamp when snapshot was written
    pub timestamp: u64,

    /// gate -> decision -> count
    pub gate_decisions: BTreeMap<String, BTreeMap<String, u64>>,
    pub gate_timing: BTreeMap<String, GateTiming>,
    pub gate_crashes: BTreeMap<String, u64>,
    pub slow_gates: u64,

    pub circuit_trips: u64,
    pub circuit_trips_by_name: BTreeMap<String, u64>,

    pub cache_hits: u64,
    pub cache_misses: u64,

    pub daemon_requests: u64,
    pub memory_requests: u64,
    pub memory_failures: u64,
    pub mentor_verdicts: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Add timestamp to snapshot
    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self
    }

    pub fn is_empty(&self) -> bool {
        let timestamp = self.timestamp;
        *self
            == Self {
                timestamp,
                ..Self::default()
            }
    }

    /// Add `other`'s counts into this snapshot
    pub fn merge(&mut self, other: &MetricsSnapshot) {
        for (gate, decisions) in &other.gate_decisions {
            let entry = self.gate_decisions.entry(gate.clone()).or_default();
            for (decision, n) in decisions {
                *entry.entry(decision.clone()).or_default() += n;
            }
        }
        for (gate, timing) in &other.gate_timing {
            let entry = self.gate_timing.entry(gate.clone()).or_default();
            entry.count += timing.count;
            entry.total_ms += timing.total_ms;
        }
        add_counts(&mut self.gate_crashes, &other.gate_crashes);
        add_counts(&mut self.circuit_trips_by_name, &other.circuit_trips_by_name);
        add_counts(&mut self.mentor_verdicts, &other.mentor_verdicts);
        self.slow_gates += other.slow_gates;
        self.circuit_trips += other.circuit_trips;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.daemon_requests += other.daemon_requests;
        self.memory_requests += other.memory_requests;
        self.memory_failures += other.memory_failures;
    }

    /// Total decisions of one kind across gates
    pub fn decisions(&self, decision: &str) -> u64 {
        self.gate_decisions
            .values()
            .filter_map(|d| d.get(decision))
            .sum()
    }
}

fn add_counts(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (k, v) in from {
        *into.entry(k.clone()).or_default() += v;
    }
}

/// Read a previously flushed snapshot; missing or corrupt files are empty
pub fn load_snapshot(path: &Path) -> MetricsSnapshot {
    read_json(path)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Global metrics instance
static METRICS: std::sync::OnceLock<MetricsCollector> = std::sync::OnceLock::new();

/// Get the global metrics collector
pub fn global() -> &'static MetricsCollector {
    METRICS.get_or_init(MetricsCollector::new)
}

static INSTALLED: std::sync::Once = std::sync::Once::new();

/// Subscribe the global collector to the global event bus (once)
pub fn install() {
    INSTALLED.call_once(|| {
        crate::events::subscribe(|event| global().observe(event));
    });
}

/// Subscribe a collector to a specific bus
pub fn attach(collector: Arc<MetricsCollector>, bus: &EventBus) {
    bus.subscribe(move |event| collector.observe(event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metrics_collector() {
        let collector = MetricsCollector::new();

        collector.record_gate_decision("gate_01", "pass", 0.4);
        collector.record_gate_decision("gate_01", "block", 1.6);
        collector.record_gate_decision("gate_02", "pass", 0.2);
        collector.record_cache_lookup(true);
        collector.record_cache_lookup(false);
        collector.record_circuit_trip("memory_socket");

        let snapshot = collector.json_snapshot();
        assert_eq!(snapshot.gate_decisions["gate_01"]["pass"], 1);
        assert_eq!(snapshot.decisions("pass"), 2);
        assert_eq!(snapshot.gate_timing["gate_01"].count, 2);
        assert!((snapshot.gate_timing["gate_01"].total_ms - 2.0).abs() < 1e-9);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.circuit_trips, 1);

        let prom = collector.prometheus_metrics();
        assert!(prom.contains("torus_gate_decisions_total"));
        assert!(prom.contains("torus_cache_lookups_total"));
    }

    #[test]
    fn test_observes_bus_events() {
        let collector = Arc::new(MetricsCollector::new());
        let bus = EventBus::new();
        attach(Arc::clone(&collector), &bus);

        bus.emit(Event::gate_decision("s", "gate_04", "Edit", "warn", "warn", 3.0));
        bus.emit(Event::daemon_request(2, 5.0));
        bus.emit(Event::circuit_opened("gate_13", 3, 60));

        let snapshot = collector.json_snapshot();
        assert_eq!(snapshot.gate_decisions["gate_04"]["warn"], 1);
        assert_eq!(snapshot.daemon_requests, 1);
        assert_eq!(snapshot.circuit_trips_by_name["gate_13"], 1);
    }

    #[test]
    fn test_flush_accumulates_across_collectors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");

        let first = MetricsCollector::new();
        first.record_gate_decision("gate_02", "block", 1.0);
        first.flush_to(&path).unwrap();
        // Pending counts were taken by the flush
        assert!(first.json_snapshot().is_empty());

        let second = MetricsCollector::new();
        second.record_gate_decision("gate_02", "block", 1.0);
        second.record_daemon_request(0);
        second.flush_to(&path).unwrap();

        let total = load_snapshot(&path);
        assert_eq!(total.gate_decisions["gate_02"]["block"], 2);
        assert_eq!(total.daemon_requests, 1);
        assert!(total.timestamp > 0);
    }

    #[test]
    fn test_replay_snapshot_into_prometheus() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot
            .gate_decisions
            .entry("gate_01_read_before_edit".into())
            .or_default()
            .insert("block".into(), 3);
        snapshot.cache_hits = 2;

        let collector = MetricsCollector::new();
        collector.replay(&snapshot);
        let text = collector.prometheus_metrics();
        assert!(text.contains(
            "torus_gate_decisions_total{decision=\"block\",gate=\"gate_01_read_before_edit\"} 3"
        ));
        assert!(text.contains("torus_cache_lookups_total{result=\"hit\"} 2"));
        // Replay only feeds Prometheus, never the pending JSON delta
        assert!(collector.json_snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_timestamp() {
        let snapshot = MetricsSnapshot::default().with_timestamp();
        assert!(snapshot.timestamp > 0);
        assert!(snapshot.is_empty());
    }
}
