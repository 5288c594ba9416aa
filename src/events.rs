//! Typed observability events.
//!
//! Gate decisions, breaker transitions, cache lookups and daemon requests are
//! published on an in-process bus. [`crate::metrics`] subscribes to turn
//! them into counters; tests subscribe to assert on them.
//!
//! ## Event Categories
//!
//! - **Gate**: per-gate decisions, slow gates, crashes
//! - **Router**: gate ordering
//! - **Circuit**: breaker transitions
//! - **Cache**: gate result cache lookups
//! - **Tracker**: PostToolUse signals (mentor verdicts)
//! - **Daemon**: socket requests and lifecycle
//! - **Memory**: memory worker calls
//!
//! ## Usage
//!
//! ```ignore
//! use torus::events::{self, Event};
//!
//! events::subscribe(|event| {
//!     tracing::debug!(subsystem = %event.subsystem, "event");
//! });
//! events::emit(Event::gate_decision("main", "gate_01", "Edit", "pass", "info", 0.4));
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonically increasing sequence counter for event ordering
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Subsystem identifiers for event categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Gate checks
    Gate,
    /// Gate ordering
    Router,
    /// Circuit breakers
    Circuit,
    /// Gate result cache
    Cache,
    /// PostToolUse tracking
    Tracker,
    /// Enforcer daemon
    Daemon,
    /// Memory worker client
    Memory,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Subsystem::Gate => "gate",
            Subsystem::Router => "router",
            Subsystem::Circuit => "circuit",
            Subsystem::Cache => "cache",
            Subsystem::Tracker => "tracker",
            Subsystem::Daemon => "daemon",
            Subsystem::Memory => "memory",
        };
        write!(f, "{}", s)
    }
}

/// Event payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Gate events
    GateDecision {
        session_id: String,
        gate: String,
        tool: String,
        decision: String,
        severity: String,
        duration_ms: f64,
    },
    GateSlow {
        gate: String,
        tool: String,
        duration_ms: f64,
    },
    GateCrashed {
        gate: String,
        tool: String,
        tier: u8,
        error: String,
    },

    // Router events
    GatesRouted {
        tool: String,
        gates: u32,
        routing_ms: f64,
    },

    // Circuit events
    CircuitOpened {
        name: String,
        failure_count: u32,
        recovery_timeout_secs: u64,
    },
    CircuitHalfOpen {
        name: String,
    },
    CircuitClosed {
        name: String,
    },

    // Cache events
    CacheLookup {
        gate: String,
        tool: String,
        hit: bool,
    },

    // Tracker events
    MentorVerdict {
        session_id: String,
        verdict: String,
        score: f64,
    },

    // Daemon events
    DaemonStarted {
        pid: u32,
        socket: String,
    },
    DaemonRequest {
        exit_code: i32,
        duration_ms: f64,
    },
    DaemonStopped {
        requests: u64,
    },

    // Memory events
    MemoryRequest {
        method: String,
        ok: bool,
        duration_ms: f64,
    },
}

/// Unified event structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number for ordering
    pub seq: u64,
    /// Timestamp in milliseconds since epoch
    pub timestamp_ms: u64,
    /// Subsystem that generated this event
    pub subsystem: Subsystem,
    /// The event data
    #[serde(flatten)]
    pub event_type: EventType,
}

impl Event {
    pub fn new(subsystem: Subsystem, event_type: EventType) -> Self {
        Self {
            seq: next_sequence(),
            timestamp_ms: timestamp_ms(),
            subsystem,
            event_type,
        }
    }

    pub fn gate_decision(
        session_id: &str,
        gate: &str,
        tool: &str,
        decision: &str,
        severity: &str,
        duration_ms: f64,
    ) -> Self {
        Self::new(
            Subsystem::Gate,
            EventType::GateDecision {
                session_id: session_id.to_string(),
                gate: gate.to_string(),
                tool: tool.to_string(),
                decision: decision.to_string(),
                severity: severity.to_string(),
                duration_ms,
            },
        )
    }

    pub fn gate_slow(gate: &str, tool: &str, duration_ms: f64) -> Self {
        Self::new(
            Subsystem::Gate,
            EventType::GateSlow {
                gate: gate.to_string(),
                tool: tool.to_string(),
                duration_ms,
            },
        )
    }

    pub fn gate_crashed(gate: &str, tool: &str, tier: u8, error: &str) -> Self {
        Self::new(
            Subsystem::Gate,
            EventType::GateCrashed {
                gate: gate.to_string(),
                tool: tool.to_string(),
                tier,
                error: error.to_string(),
            },
        )
    }

    pub fn gates_routed(tool: &str, gates: u32, routing_ms: f64) -> Self {
        Self::new(
            Subsystem::Router,
            EventType::GatesRouted {
                tool: tool.to_string(),
                gates,
                routing_ms,
            },
        )
    }

    pub fn circuit_opened(name: &str, failure_count: u32, recovery_timeout_secs: u64) -> Self {
        Self::new(
            Subsystem::Circuit,
            EventType::CircuitOpened {
                name: name.to_string(),
                failure_count,
                recovery_timeout_secs,
            },
        )
    }

    pub fn circuit_half_open(name: &str) -> Self {
        Self::new(
            Subsystem::Circuit,
            EventType::CircuitHalfOpen {
                name: name.to_string(),
            },
        )
    }

    pub fn circuit_closed(name: &str) -> Self {
        Self::new(
            Subsystem::Circuit,
            EventType::CircuitClosed {
                name: name.to_string(),
            },
        )
    }

    pub fn cache_lookup(gate: &str, tool: &str, hit: bool) -> Self {
        Self::new(
            Subsystem::Cache,
            EventType::CacheLookup {
                gate: gate.to_string(),
                tool: tool.to_string(),
                hit,
            },
        )
    }

    pub fn mentor_verdict(session_id: &str, verdict: &str, score: f64) -> Self {
        Self::new(
            Subsystem::Tracker,
            EventType::MentorVerdict {
                session_id: session_id.to_string(),
                verdict: verdict.to_string(),
                score,
            },
        )
    }

    pub fn daemon_started(pid: u32, socket: &str) -> Self {
        Self::new(
            Subsystem::Daemon,
            EventType::DaemonStarted {
                pid,
                socket: socket.to_string(),
            },
        )
    }

    pub fn daemon_request(exit_code: i32, duration_ms: f64) -> Self {
        Self::new(
            Subsystem::Daemon,
            EventType::DaemonRequest {
                exit_code,
                duration_ms,
            },
        )
    }

    pub fn daemon_stopped(requests: u64) -> Self {
        Self::new(Subsystem::Daemon, EventType::DaemonStopped { requests })
    }

    pub fn memory_request(method: &str, ok: bool, duration_ms: f64) -> Self {
        Self::new(
            Subsystem::Memory,
            EventType::MemoryRequest {
                method: method.to_string(),
                ok,
                duration_ms,
            },
        )
    }
}

/// Event listener callback type
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Event bus for publishing and subscribing to events
pub struct EventBus {
    listeners: RwLock<Vec<EventListener>>,
    /// Filter by subsystem (None = all)
    subsystem_filters: RwLock<HashMap<usize, Vec<Subsystem>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to all events
    pub fn subscribe<F>(&self, listener: F) -> usize
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let id = listeners.len();
        listeners.push(Arc::new(listener));
        id
    }

    /// Subscribe to specific subsystems only
    pub fn subscribe_filtered<F>(&self, subsystems: Vec<Subsystem>, listener: F) -> usize
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.subscribe(listener);
        let mut filters = self
            .subsystem_filters
            .write()
            .unwrap_or_else(|e| e.into_inner());
        filters.insert(id, subsystems);
        id
    }

    /// Deliver to every matching subscriber before returning. Hook processes
    /// exit right after dispatch, so nothing is deferred to other threads.
    pub fn emit(&self, event: Event) {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        let filters = self
            .subsystem_filters
            .read()
            .unwrap_or_else(|e| e.into_inner());

        for (id, listener) in listeners.iter().enumerate() {
            if let Some(allowed) = filters.get(&id) {
                if !allowed.contains(&event.subsystem) {
                    continue;
                }
            }

            // A panicking listener must not take the dispatcher down with it
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&event);
            }));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .map(|l| l.len())
            .unwrap_or_else(|e| e.into_inner().len())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            subsystem_filters: RwLock::new(HashMap::new()),
        }
    }
}

/// Global event bus singleton
static GLOBAL_BUS: std::sync::OnceLock<Arc<EventBus>> = std::sync::OnceLock::new();

/// Get the global event bus
pub fn global_bus() -> &'static Arc<EventBus> {
    GLOBAL_BUS.get_or_init(EventBus::new)
}

/// Emit an event to the global bus
pub fn emit(event: Event) {
    global_bus().emit(event);
}

/// Subscribe to the global bus
pub fn subscribe<F>(listener: F) -> usize
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    global_bus().subscribe(listener)
}

/// Subscribe to specific subsystems on the global bus
pub fn subscribe_filtered<F>(subsystems: Vec<Subsystem>, listener: F) -> usize
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    global_bus().subscribe_filtered(subsystems, listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_event_sequence() {
        let e1 = Event::gate_slow("gate_01", "Edit", 120.0);
        let e2 = Event::gate_slow("gate_01", "Edit", 130.0);
        assert!(e2.seq > e1.seq);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::gate_decision("session-1", "gate_02", "Bash", "block", "info", 1.5);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"gate_decision\""));
        assert!(json.contains("\"subsystem\":\"gate\""));
        assert!(json.contains("session-1"));
    }

    #[test]
    fn test_event_bus_subscribe() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        bus.subscribe(move |_event| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::daemon_request(0, 3.0));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_subsystem_filter() {
        let bus = EventBus::new();
        let gate_counter = Arc::new(AtomicUsize::new(0));
        let cache_counter = Arc::new(AtomicUsize::new(0));

        let gc = Arc::clone(&gate_counter);
        bus.subscribe_filtered(vec![Subsystem::Gate], move |_| {
            gc.fetch_add(1, Ordering::SeqCst);
        });

        let cc = Arc::clone(&cache_counter);
        bus.subscribe_filtered(vec![Subsystem::Cache], move |_| {
            cc.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::gate_crashed("gate_04", "Edit", 2, "boom"));
        bus.emit(Event::cache_lookup("gate_04", "Edit", true));
        bus.emit(Event::cache_lookup("gate_04", "Edit", false));

        assert_eq!(gate_counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache_counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| panic!("listener bug"));
        let c = Arc::clone(&counter);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(Event::circuit_closed("memory_socket"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
