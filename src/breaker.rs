//! File-backed circuit breakers.
//!
//! State machine: Closed → Open → HalfOpen
//! - [`GateBreaker`] tracks crashes of individual gates and skips a gate that
//!   keeps crashing. Tier 1 gates are tracked but never opened or skipped.
//! - [`ServiceBreaker`] guards external services such as the memory worker.
//!
//! Both persist to JSON in the hooks dir so hook processes share state.
//! Every operation is fail-open: persistence errors are logged and ignored.

use crate::config::Paths;
use crate::events::{self, Event};
use crate::state::store::{lock_path_for, read_json, write_json_atomic, FileLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Crashes inside the window that open a gate circuit
pub const GATE_CRASH_THRESHOLD: usize = 3;
pub const GATE_CRASH_WINDOW_SECS: f64 = 300.0;
/// Time in Open before a probe is let through
pub const GATE_COOLDOWN_SECS: f64 = 60.0;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: f64 = 60.0;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-gate crash record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateCircuit {
    pub state: CircuitState,
    pub crash_timestamps: Vec<f64>,
    pub opened_at: Option<f64>,
    pub total_crashes: u64,
    pub total_skips: u64,
}

impl GateCircuit {
    fn maybe_recover(&mut self, name: &str, now: f64) -> bool {
        if self.state == CircuitState::Open
            && now - self.opened_at.unwrap_or(0.0) >= GATE_COOLDOWN_SECS
        {
            self.state = CircuitState::HalfOpen;
            events::emit(Event::circuit_half_open(name));
            return true;
        }
        false
    }
}

/// Crash tracking for gates, persisted to `.circuit_breaker_state.json`
#[derive(Debug, Clone)]
pub struct GateBreaker {
    path: PathBuf,
}

impl GateBreaker {
    pub fn new(paths: &Paths) -> Self {
        Self {
            path: paths.gate_breaker_file(),
        }
    }

    fn load(&self) -> BTreeMap<String, GateCircuit> {
        read_json(&self.path)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn save(&self, data: &BTreeMap<String, GateCircuit>) {
        if let Err(e) = write_json_atomic(&self.path, data) {
            tracing::warn!(error = %e, "failed to persist gate circuit state");
        }
    }

    /// Run `f` over the table under the file lock, saving when it reports a change
    fn update<T>(&self, f: impl FnOnce(&mut BTreeMap<String, GateCircuit>) -> (T, bool)) -> T {
        let _lock = FileLock::exclusive(&lock_path_for(&self.path))
            .map_err(|e| tracing::debug!(error = %e, "gate breaker lock unavailable"))
            .ok();
        let mut data = self.load();
        let (value, dirty) = f(&mut data);
        if dirty {
            self.save(&data);
        }
        value
    }

    /// True while the gate's circuit is open. Tier 1 gates are never skipped.
    pub fn should_skip(&self, gate: &str, tier1: bool, now: f64) -> bool {
        if tier1 {
            return false;
        }
        self.update(|data| {
            let Some(rec) = data.get_mut(gate) else {
                return (false, false);
            };
            let recovered = rec.maybe_recover(gate, now);
            if rec.state == CircuitState::Open {
                rec.total_skips += 1;
                return (true, true);
            }
            (false, recovered)
        })
    }

    /// Record a gate run. `success = false` means the gate crashed.
    pub fn record(&self, gate: &str, tier1: bool, success: bool, now: f64) {
        self.update(|data| {
            if success && !data.contains_key(gate) {
                return ((), false);
            }
            let rec = data.entry(gate.to_string()).or_default();
            let mut dirty = rec.maybe_recover(gate, now);

            if !success {
                rec.crash_timestamps.push(now);
                rec.crash_timestamps
                    .retain(|t| *t >= now - GATE_CRASH_WINDOW_SECS);
                rec.total_crashes += 1;
                dirty = true;

                if !tier1 {
                    let trip = match rec.state {
                        CircuitState::HalfOpen => true,
                        CircuitState::Closed => {
                            rec.crash_timestamps.len() >= GATE_CRASH_THRESHOLD
                        }
                        CircuitState::Open => false,
                    };
                    if trip {
                        rec.state = CircuitState::Open;
                        rec.opened_at = Some(now);
                        tracing::warn!(
                            gate,
                            crashes = rec.crash_timestamps.len(),
                            "gate circuit opened"
                        );
                        events::emit(Event::circuit_opened(
                            gate,
                            rec.crash_timestamps.len() as u32,
                            GATE_COOLDOWN_SECS as u64,
                        ));
                    }
                }
            } else if rec.state == CircuitState::HalfOpen {
                rec.state = CircuitState::Closed;
                rec.crash_timestamps.clear();
                rec.opened_at = None;
                dirty = true;
                tracing::info!(gate, "gate circuit closed after successful probe");
                events::emit(Event::circuit_closed(gate));
            }
            ((), dirty)
        })
    }

    pub fn state(&self, gate: &str, now: f64) -> CircuitState {
        self.update(|data| match data.get_mut(gate) {
            Some(rec) => {
                let recovered = rec.maybe_recover(gate, now);
                (rec.state, recovered)
            }
            None => (CircuitState::Closed, false),
        })
    }

    pub fn reset(&self, gate: &str) {
        self.update(|data| {
            data.insert(gate.to_string(), GateCircuit::default());
            ((), true)
        })
    }

    pub fn all(&self) -> BTreeMap<String, GateCircuit> {
        self.load()
    }
}

/// Per-service breaker record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCircuit {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Consecutive successes while half-open
    pub success_count: u32,
    pub last_failure_time: Option<f64>,
    pub opened_at: Option<f64>,
    pub failure_threshold: u32,
    pub recovery_timeout: f64,
    pub success_threshold: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
}

impl Default for ServiceCircuit {
    fn default() -> Self {
        Self::with_thresholds(ServiceThresholds::default())
    }
}

/// Thresholds a service is created with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceThresholds {
    pub failure_threshold: u32,
    pub recovery_timeout: f64,
    pub success_threshold: u32,
}

impl Default for ServiceThresholds {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT_SECS,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

impl ServiceCircuit {
    pub fn with_thresholds(t: ServiceThresholds) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            opened_at: None,
            failure_threshold: t.failure_threshold,
            recovery_timeout: t.recovery_timeout,
            success_threshold: t.success_threshold,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
        }
    }

    fn maybe_recover(&mut self, name: &str, now: f64) {
        if self.state == CircuitState::Open {
            let opened_at = self.opened_at.or(self.last_failure_time).unwrap_or(0.0);
            if now - opened_at >= self.recovery_timeout {
                self.state = CircuitState::HalfOpen;
                self.failure_count = 0;
                self.success_count = 0;
                events::emit(Event::circuit_half_open(name));
            }
        }
    }
}

/// Breakers for external services, persisted to `.circuit_breaker.json`
#[derive(Debug, Clone)]
pub struct ServiceBreaker {
    path: PathBuf,
}

impl ServiceBreaker {
    pub fn new(paths: &Paths) -> Self {
        Self {
            path: paths.service_breaker_file(),
        }
    }

    fn load(&self) -> BTreeMap<String, ServiceCircuit> {
        read_json(&self.path)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn update<T>(&self, f: impl FnOnce(&mut BTreeMap<String, ServiceCircuit>) -> T) -> T {
        let _lock = FileLock::exclusive(&lock_path_for(&self.path))
            .map_err(|e| tracing::debug!(error = %e, "service breaker lock unavailable"))
            .ok();
        let mut data = self.load();
        let value = f(&mut data);
        if let Err(e) = write_json_atomic(&self.path, &data) {
            tracing::warn!(error = %e, "failed to persist service circuit state");
        }
        value
    }

    /// True when calls to `service` should be rejected. Counts a rejection.
    pub fn is_open(&self, service: &str, now: f64) -> bool {
        self.update(|data| match data.get_mut(service) {
            Some(rec) => {
                rec.maybe_recover(service, now);
                if rec.state == CircuitState::Open {
                    rec.total_rejections += 1;
                    true
                } else {
                    false
                }
            }
            None => false,
        })
    }

    pub fn record_success(&self, service: &str, thresholds: ServiceThresholds, now: f64) {
        self.update(|data| {
            let rec = data
                .entry(service.to_string())
                .or_insert_with(|| ServiceCircuit::with_thresholds(thresholds));
            rec.maybe_recover(service, now);
            rec.total_successes += 1;
            match rec.state {
                CircuitState::Closed => rec.failure_count = 0,
                CircuitState::HalfOpen => {
                    rec.success_count += 1;
                    if rec.success_count >= rec.success_threshold {
                        rec.state = CircuitState::Closed;
                        rec.failure_count = 0;
                        rec.success_count = 0;
                        rec.opened_at = None;
                        tracing::info!(service, "service circuit closed");
                        events::emit(Event::circuit_closed(service));
                    }
                }
                CircuitState::Open => {}
            }
        })
    }

    pub fn record_failure(&self, service: &str, thresholds: ServiceThresholds, now: f64) {
        self.update(|data| {
            let rec = data
                .entry(service.to_string())
                .or_insert_with(|| ServiceCircuit::with_thresholds(thresholds));
            rec.maybe_recover(service, now);
            rec.last_failure_time = Some(now);
            rec.total_failures += 1;
            let opened = match rec.state {
                CircuitState::Closed => {
                    rec.failure_count += 1;
                    if rec.failure_count >= rec.failure_threshold {
                        rec.state = CircuitState::Open;
                        rec.opened_at = Some(now);
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => {
                    rec.state = CircuitState::Open;
                    rec.opened_at = Some(now);
                    rec.failure_count = 1;
                    rec.success_count = 0;
                    true
                }
                CircuitState::Open => false,
            };
            if opened {
                tracing::warn!(
                    service,
                    failures = rec.failure_count,
                    "service circuit opened"
                );
                events::emit(Event::circuit_opened(
                    service,
                    rec.failure_count,
                    rec.recovery_timeout as u64,
                ));
            }
        })
    }

    pub fn state(&self, service: &str, now: f64) -> CircuitState {
        self.update(|data| match data.get_mut(service) {
            Some(rec) => {
                rec.maybe_recover(service, now);
                rec.state
            }
            None => CircuitState::Closed,
        })
    }

    pub fn all(&self, now: f64) -> BTreeMap<String, ServiceCircuit> {
        self.update(|data| {
            for (name, rec) in data.iter_mut() {
                rec.maybe_recover(name, now);
            }
            data.clone()
        })
    }

    /// Back to Closed with counters cleared; configured thresholds survive
    pub fn reset(&self, service: &str) {
        self.update(|data| {
            if let Some(rec) = data.get_mut(service) {
                *rec = ServiceCircuit::with_thresholds(ServiceThresholds {
                    failure_threshold: rec.failure_threshold,
                    recovery_timeout: rec.recovery_timeout,
                    success_threshold: rec.success_threshold,
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GATE: &str = "gate_13_workspace_isolation";

    fn paths(dir: &TempDir) -> Paths {
        Paths::under(dir.path())
    }

    #[test]
    fn test_gate_opens_after_three_crashes() {
        let dir = TempDir::new().unwrap();
        let breaker = GateBreaker::new(&paths(&dir));

        breaker.record(GATE, false, false, 1000.0);
        breaker.record(GATE, false, false, 1010.0);
        assert!(!breaker.should_skip(GATE, false, 1011.0));
        breaker.record(GATE, false, false, 1020.0);

        assert_eq!(breaker.state(GATE, 1021.0), CircuitState::Open);
        assert!(breaker.should_skip(GATE, false, 1021.0));
        assert_eq!(breaker.all()[GATE].total_skips, 1);
    }

    #[test]
    fn test_crashes_outside_window_do_not_count() {
        let dir = TempDir::new().unwrap();
        let breaker = GateBreaker::new(&paths(&dir));
        breaker.record(GATE, false, false, 0.0);
        breaker.record(GATE, false, false, 10.0);
        breaker.record(GATE, false, false, 400.0);
        assert_eq!(breaker.state(GATE, 401.0), CircuitState::Closed);
    }

    #[test]
    fn test_gate_half_open_probe() {
        let dir = TempDir::new().unwrap();
        let breaker = GateBreaker::new(&paths(&dir));
        for t in [0.0, 1.0, 2.0] {
            breaker.record(GATE, false, false, t);
        }
        // Cooldown elapsed: probe allowed
        assert!(!breaker.should_skip(GATE, false, 70.0));
        assert_eq!(breaker.state(GATE, 70.0), CircuitState::HalfOpen);

        // Crash in half-open re-opens
        breaker.record(GATE, false, false, 71.0);
        assert_eq!(breaker.state(GATE, 72.0), CircuitState::Open);

        // Successful probe closes
        breaker.record(GATE, false, true, 140.0);
        assert_eq!(breaker.state(GATE, 141.0), CircuitState::Closed);
        assert!(breaker.all()[GATE].crash_timestamps.is_empty());
    }

    #[test]
    fn test_tier1_never_opens() {
        let dir = TempDir::new().unwrap();
        let breaker = GateBreaker::new(&paths(&dir));
        let gate = "gate_02_no_destroy";
        for t in 0..5 {
            breaker.record(gate, true, false, f64::from(t));
        }
        assert_eq!(breaker.state(gate, 6.0), CircuitState::Closed);
        assert!(!breaker.should_skip(gate, true, 6.0));
        assert_eq!(breaker.all()[gate].total_crashes, 5);
    }

    #[test]
    fn test_success_on_unknown_gate_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let p = paths(&dir);
        let breaker = GateBreaker::new(&p);
        breaker.record(GATE, false, true, 0.0);
        assert!(!p.gate_breaker_file().exists());
    }

    #[test]
    fn test_reset_gate() {
        let dir = TempDir::new().unwrap();
        let breaker = GateBreaker::new(&paths(&dir));
        for t in [0.0, 1.0, 2.0] {
            breaker.record(GATE, false, false, t);
        }
        breaker.reset(GATE);
        assert_eq!(breaker.state(GATE, 3.0), CircuitState::Closed);
        assert_eq!(breaker.all()[GATE].total_crashes, 0);
    }

    #[test]
    fn test_service_breaker_cycle() {
        let dir = TempDir::new().unwrap();
        let breaker = ServiceBreaker::new(&paths(&dir));
        let t = ServiceThresholds {
            failure_threshold: 3,
            recovery_timeout: 30.0,
            success_threshold: 1,
        };

        assert!(!breaker.is_open("memory_socket", 0.0));
        for now in [1.0, 2.0, 3.0] {
            breaker.record_failure("memory_socket", t, now);
        }
        assert!(breaker.is_open("memory_socket", 4.0));
        assert_eq!(breaker.all(4.0)["memory_socket"].total_rejections, 1);

        // Recovery timeout elapsed: half-open, probe allowed
        assert!(!breaker.is_open("memory_socket", 40.0));
        assert_eq!(
            breaker.state("memory_socket", 40.0),
            CircuitState::HalfOpen
        );
        breaker.record_success("memory_socket", t, 41.0);
        assert_eq!(breaker.state("memory_socket", 42.0), CircuitState::Closed);
    }

    #[test]
    fn test_service_half_open_failure_reopens() {
        let dir = TempDir::new().unwrap();
        let breaker = ServiceBreaker::new(&paths(&dir));
        let t = ServiceThresholds::default();
        for now in 0..5 {
            breaker.record_failure("svc", t, f64::from(now));
        }
        assert_eq!(breaker.state("svc", 10.0), CircuitState::Open);
        assert_eq!(breaker.state("svc", 70.0), CircuitState::HalfOpen);
        breaker.record_failure("svc", t, 71.0);
        let rec = &breaker.all(72.0)["svc"];
        assert_eq!(rec.state, CircuitState::Open);
        assert_eq!(rec.failure_count, 1);
    }

    #[test]
    fn test_service_success_resets_failures_and_reset_keeps_thresholds() {
        let dir = TempDir::new().unwrap();
        let breaker = ServiceBreaker::new(&paths(&dir));
        let t = ServiceThresholds {
            failure_threshold: 3,
            recovery_timeout: 30.0,
            success_threshold: 1,
        };
        breaker.record_failure("svc", t, 0.0);
        breaker.record_failure("svc", t, 1.0);
        breaker.record_success("svc", t, 2.0);
        assert_eq!(breaker.all(3.0)["svc"].failure_count, 0);

        breaker.reset("svc");
        let rec = &breaker.all(4.0)["svc"];
        assert_eq!(rec.total_successes, 0);
        assert_eq!(rec.failure_threshold, 3);
    }
}
