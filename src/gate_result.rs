//! The value every gate check returns.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// How serious a gate finding is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graduated escalation for a gate decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Escalation {
    Block,
    Ask,
    Warn,
    Allow,
}

impl Escalation {
    /// Parse an escalation name; anything unrecognised escalates to `Block`
    pub fn parse_or_block(s: &str) -> Self {
        match s {
            "block" => Self::Block,
            "ask" => Self::Ask,
            "warn" => Self::Warn,
            "allow" => Self::Allow,
            _ => Self::Block,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Ask => "ask",
            Self::Warn => "warn",
            Self::Allow => "allow",
        }
    }
}

/// Outcome of a single gate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub blocked: bool,
    pub message: String,
    pub gate_name: String,
    pub severity: Severity,
    pub duration_ms: Option<f64>,
    pub metadata: Map<String, Value>,
    pub escalation: Escalation,
}

impl GateResult {
    /// Build a result; escalation is inferred from `blocked` when not given
    pub fn new(blocked: bool, message: impl Into<String>, gate_name: impl Into<String>) -> Self {
        Self {
            blocked,
            message: message.into(),
            gate_name: gate_name.into(),
            severity: Severity::Info,
            duration_ms: None,
            metadata: Map::new(),
            escalation: if blocked {
                Escalation::Block
            } else {
                Escalation::Allow
            },
        }
    }

    /// Allow with no message
    pub fn pass(gate_name: &str) -> Self {
        Self::new(false, "", gate_name)
    }

    /// Hard block
    pub fn block(gate_name: &str, message: impl Into<String>) -> Self {
        Self::new(true, message, gate_name)
    }

    /// Allow, carrying an advisory message
    pub fn warn(gate_name: &str, message: impl Into<String>) -> Self {
        Self::new(false, message, gate_name).with_severity(Severity::Warn)
    }

    /// Ask the user to confirm the call
    pub fn ask(gate_name: &str, message: impl Into<String>) -> Self {
        Self::new(true, message, gate_name).with_escalation("ask")
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_escalation(mut self, escalation: &str) -> Self {
        self.escalation = Escalation::parse_or_block(escalation);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_ask(&self) -> bool {
        self.escalation == Escalation::Ask
    }

    /// Advisory warning that lets the call through
    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warn && !self.blocked
    }

    /// The host's `hookSpecificOutput` payload, if this decision has one
    pub fn to_hook_decision(&self) -> Option<Value> {
        match self.escalation {
            Escalation::Block => Some(json!({
                "hookSpecificOutput": {"permissionDecision": "deny", "reason": self.message}
            })),
            Escalation::Ask => Some(json!({
                "hookSpecificOutput": {"permissionDecision": "ask"}
            })),
            Escalation::Warn | Escalation::Allow => None,
        }
    }
}

impl std::fmt::Display for GateResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.blocked { "BLOCKED" } else { "PASS" };
        if !matches!(self.escalation, Escalation::Block | Escalation::Allow) {
            return write!(
                f,
                "GateResult({}, {}, escalation={})",
                status,
                self.gate_name,
                self.escalation.as_str()
            );
        }
        if self.severity != Severity::Info {
            return write!(
                f,
                "GateResult({}, {}, severity={})",
                status, self.gate_name, self.severity
            );
        }
        write!(f, "GateResult({}, {})", status, self.gate_name)
    }
}
