//! Torus: tool-call gate enforcement for an AI coding assistant's hook system.
//!
//! The PreToolUse path runs the [`enforcer`] over a priority-ordered set of
//! [`gates`]; the PostToolUse path runs the [`tracker`], which feeds the
//! per-session [`state`] those gates read.

pub mod audit;
pub mod breaker;
pub mod cache;
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod enforcer;
pub mod error_normalizer;
pub mod events;
pub mod exemptions;
pub mod gate_result;
pub mod gates;
pub mod hook;
pub mod logging;
pub mod memory_client;
pub mod metrics;
pub mod profiles;
pub mod router;
pub mod state;
pub mod tracker;

pub use config::{Config, Paths, Toggles};
pub use enforcer::Enforcer;
pub use gate_result::{Escalation, GateResult, Severity};
pub use hook::{HookInput, HookOutcome, ToolCall};
pub use state::SessionState;
