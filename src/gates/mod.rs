//! Gate registry.
//!
//! Every gate is a unit struct implementing [`Gate`]. The registry lists them
//! in priority order: Tier 1 safety gates first, rate limiting last so earlier
//! blocks never inflate its counter.

mod canary;
mod causal_chain;
mod code_quality;
mod confidence_check;
mod critical_file_guard;
pub mod hindsight;
pub mod injection_defense;
mod memory_first;
mod model_enforcement;
pub mod no_destroy;
mod proof_before_fixed;
mod rate_limit;
mod read_before_edit;
mod save_fix;
mod strategy_ban;
pub mod test_before_deploy;
mod workspace_isolation;

use crate::config::{Paths, Toggles};
use crate::exemptions::Exemptions;
use crate::gate_result::GateResult;
use crate::hook::ToolCall;
use crate::state::{sideband, SessionState};
use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use std::panic::{catch_unwind, AssertUnwindSafe};

const EDIT: &[&str] = &["Edit", "Write", "NotebookEdit"];
const EDIT_TASK: &[&str] = &["Edit", "Write", "NotebookEdit", "Task"];
const SAVE_FIX_TOOLS: &[&str] = &["Edit", "Write", "Task", "Bash", "NotebookEdit"];
const BASH: &[&str] = &["Bash"];
const TASK: &[&str] = &["Task"];
const WEB: &[&str] = &["WebFetch", "WebSearch"];

/// Identity and static metadata of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GateId {
    ReadBeforeEdit,
    NoDestroy,
    TestBeforeDeploy,
    MemoryFirst,
    ProofBeforeFixed,
    SaveFix,
    CriticalFileGuard,
    StrategyBan,
    ModelEnforcement,
    WorkspaceIsolation,
    ConfidenceCheck,
    CausalChain,
    CodeQuality,
    InjectionDefense,
    Canary,
    Hindsight,
    RateLimit,
}

impl GateId {
    /// Registry order
    pub const ALL: [GateId; 17] = [
        Self::ReadBeforeEdit,
        Self::NoDestroy,
        Self::TestBeforeDeploy,
        Self::MemoryFirst,
        Self::ProofBeforeFixed,
        Self::SaveFix,
        Self::CriticalFileGuard,
        Self::StrategyBan,
        Self::ModelEnforcement,
        Self::WorkspaceIsolation,
        Self::ConfidenceCheck,
        Self::CausalChain,
        Self::CodeQuality,
        Self::InjectionDefense,
        Self::Canary,
        Self::Hindsight,
        Self::RateLimit,
    ];

    pub fn number(&self) -> u8 {
        match self {
            Self::ReadBeforeEdit => 1,
            Self::NoDestroy => 2,
            Self::TestBeforeDeploy => 3,
            Self::MemoryFirst => 4,
            Self::ProofBeforeFixed => 5,
            Self::SaveFix => 6,
            Self::CriticalFileGuard => 7,
            Self::StrategyBan => 9,
            Self::ModelEnforcement => 10,
            Self::RateLimit => 11,
            Self::WorkspaceIsolation => 13,
            Self::ConfidenceCheck => 14,
            Self::CausalChain => 15,
            Self::CodeQuality => 16,
            Self::InjectionDefense => 17,
            Self::Canary => 18,
            Self::Hindsight => 19,
        }
    }

    /// Full name, e.g. `gate_01_read_before_edit`
    pub fn module_name(&self) -> &'static str {
        match self {
            Self::ReadBeforeEdit => "gate_01_read_before_edit",
            Self::NoDestroy => "gate_02_no_destroy",
            Self::TestBeforeDeploy => "gate_03_test_before_deploy",
            Self::MemoryFirst => "gate_04_memory_first",
            Self::ProofBeforeFixed => "gate_05_proof_before_fixed",
            Self::SaveFix => "gate_06_save_fix",
            Self::CriticalFileGuard => "gate_07_critical_file_guard",
            Self::StrategyBan => "gate_09_strategy_ban",
            Self::ModelEnforcement => "gate_10_model_enforcement",
            Self::RateLimit => "gate_11_rate_limit",
            Self::WorkspaceIsolation => "gate_13_workspace_isolation",
            Self::ConfidenceCheck => "gate_14_confidence_check",
            Self::CausalChain => "gate_15_causal_chain",
            Self::CodeQuality => "gate_16_code_quality",
            Self::InjectionDefense => "gate_17_injection_defense",
            Self::Canary => "gate_18_canary",
            Self::Hindsight => "gate_19_hindsight",
        }
    }

    /// `gate_NN`
    pub fn short_name(&self) -> &'static str {
        &self.module_name()[..7]
    }

    /// Display label used in messages and the audit log
    pub fn label(&self) -> &'static str {
        match self {
            Self::ReadBeforeEdit => "GATE 1: READ BEFORE EDIT",
            Self::NoDestroy => "GATE 2: NO DESTROY",
            Self::TestBeforeDeploy => "GATE 3: TEST BEFORE DEPLOY",
            Self::MemoryFirst => "GATE 4: MEMORY FIRST",
            Self::ProofBeforeFixed => "GATE 5: PROOF BEFORE FIXED",
            Self::SaveFix => "GATE 6: SAVE TO MEMORY",
            Self::CriticalFileGuard => "GATE 7: CRITICAL FILE GUARD",
            Self::StrategyBan => "GATE 9: STRATEGY BAN",
            Self::ModelEnforcement => "GATE 10: MODEL COST GUARD",
            Self::RateLimit => "GATE 11: RATE LIMIT",
            Self::WorkspaceIsolation => "GATE 13: WORKSPACE ISOLATION",
            Self::ConfidenceCheck => "GATE 14: CONFIDENCE CHECK",
            Self::CausalChain => "GATE 15: CAUSAL CHAIN ENFORCEMENT",
            Self::CodeQuality => "GATE 16: CODE QUALITY",
            Self::InjectionDefense => "GATE 17: INJECTION DEFENSE",
            Self::Canary => "GATE 18: CANARY",
            Self::Hindsight => "GATE 19: HINDSIGHT",
        }
    }

    pub fn tier(&self) -> u8 {
        match self.number() {
            1..=3 => 1,
            4..=7 => 2,
            _ => 3,
        }
    }

    pub fn is_tier1(&self) -> bool {
        self.tier() == 1
    }

    /// Tools this gate runs for; `None` means every tool
    pub fn watched_tools(&self) -> Option<&'static [&'static str]> {
        match self {
            Self::ReadBeforeEdit
            | Self::ProofBeforeFixed
            | Self::CriticalFileGuard
            | Self::StrategyBan
            | Self::WorkspaceIsolation
            | Self::ConfidenceCheck
            | Self::CausalChain
            | Self::CodeQuality
            | Self::Hindsight => Some(EDIT),
            Self::NoDestroy | Self::TestBeforeDeploy => Some(BASH),
            Self::MemoryFirst => Some(EDIT_TASK),
            Self::SaveFix => Some(SAVE_FIX_TOOLS),
            Self::ModelEnforcement => Some(TASK),
            Self::InjectionDefense => Some(WEB),
            Self::RateLimit | Self::Canary => None,
        }
    }

    pub fn watches(&self, tool_name: &str) -> bool {
        self.watched_tools()
            .map(|tools| tools.contains(&tool_name))
            .unwrap_or(true)
    }

    /// State keys the gate reads; recorded with every audit entry
    pub fn state_reads(&self) -> &'static [&'static str] {
        match self {
            Self::ReadBeforeEdit => &["files_read"],
            Self::NoDestroy | Self::WorkspaceIsolation => &[],
            Self::TestBeforeDeploy => &["last_test_run", "last_test_exit_code"],
            Self::MemoryFirst | Self::CriticalFileGuard => &["memory_last_queried"],
            Self::ProofBeforeFixed => &["pending_verification", "verification_scores"],
            Self::SaveFix => &[
                "gate6_warn_count",
                "verified_fixes",
                "unlogged_errors",
                "error_pattern_counts",
                "pending_chain_ids",
                "last_exit_plan_mode",
                "memory_last_queried",
            ],
            Self::StrategyBan => &[
                "current_strategy_id",
                "active_bans",
                "successful_strategies",
            ],
            Self::ModelEnforcement => &[],
            Self::RateLimit => &["tool_call_count", "session_start"],
            Self::ConfidenceCheck => &[
                "session_test_baseline",
                "pending_verification",
                "fixing_error",
            ],
            Self::CausalChain => &["recent_test_failure", "fix_history_queried", "fixing_error"],
            Self::CodeQuality => &["code_quality_warnings_per_file"],
            Self::InjectionDefense => &["injection_attempts"],
            Self::Canary => CANARY_KEYS,
            Self::Hindsight => &[
                "mentor_last_verdict",
                "mentor_last_score",
                "mentor_escalation_count",
                "mentor_chain_score",
                "mentor_memory_match",
                "mentor_warned_this_cycle",
                "fixing_error",
            ],
        }
    }

    /// State keys the gate writes
    pub fn state_writes(&self) -> &'static [&'static str] {
        match self {
            Self::SaveFix => &["gate6_warn_count"],
            Self::ModelEnforcement => &["model_agent_usage"],
            Self::CodeQuality => &["code_quality_warnings_per_file"],
            Self::InjectionDefense => &["injection_attempts"],
            Self::Canary => CANARY_KEYS,
            Self::RateLimit => &["rate_window_timestamps"],
            _ => &[],
        }
    }

    /// Resolve `gates.gate_04_memory_first`, `gate_04_memory_first` or `gate_04`
    pub fn from_name(name: &str) -> Option<Self> {
        let short = short_gate_name(name);
        Self::ALL.into_iter().find(|g| g.short_name() == short)
    }
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

const CANARY_KEYS: &[&str] = &[
    "canary_tool_counts",
    "canary_seen_tools",
    "canary_total_calls",
    "canary_size_count",
    "canary_size_mean",
    "canary_size_m2",
    "canary_short_timestamps",
    "canary_long_timestamps",
    "canary_recent_seq",
];

/// Strip a `gates.` prefix and keep the first two `_` segments: `gate_04`
pub fn short_gate_name(name: &str) -> String {
    let name = name.strip_prefix("gates.").unwrap_or(name);
    name.splitn(3, '_').take(2).collect::<Vec<_>>().join("_")
}

/// Everything a gate may consult besides the call and session state
pub struct GateContext<'a> {
    pub paths: &'a Paths,
    pub toggles: &'a Toggles,
    pub exemptions: Exemptions,
    /// Wall clock, seconds since the epoch
    pub now: f64,
}

impl<'a> GateContext<'a> {
    pub fn new(paths: &'a Paths, toggles: &'a Toggles, now: f64) -> Self {
        Self {
            paths,
            toggles,
            exemptions: Exemptions::new(&paths.skills_dir()),
            now,
        }
    }

    /// Latest memory query time, from state or the sideband
    pub fn memory_last_queried(&self, state: &SessionState) -> f64 {
        sideband::get_memory_last_queried(state, self.paths, self.now)
    }
}

/// A single enforcement check
pub trait Gate: Send + Sync {
    fn id(&self) -> GateId;

    /// Inspect a tool call. Errors are crashes; the dispatcher decides
    /// whether they fail open or closed.
    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult>;
}

static REGISTRY: Lazy<Vec<Box<dyn Gate>>> = Lazy::new(|| {
    vec![
        Box::new(read_before_edit::ReadBeforeEdit),
        Box::new(no_destroy::NoDestroy),
        Box::new(test_before_deploy::TestBeforeDeploy),
        Box::new(memory_first::MemoryFirst),
        Box::new(proof_before_fixed::ProofBeforeFixed),
        Box::new(save_fix::SaveFix),
        Box::new(critical_file_guard::CriticalFileGuard),
        Box::new(strategy_ban::StrategyBan),
        Box::new(model_enforcement::ModelEnforcement),
        Box::new(workspace_isolation::WorkspaceIsolation),
        Box::new(confidence_check::ConfidenceCheck),
        Box::new(causal_chain::CausalChain),
        Box::new(code_quality::CodeQuality),
        Box::new(injection_defense::InjectionDefense),
        Box::new(canary::Canary),
        Box::new(hindsight::Hindsight),
        Box::new(rate_limit::RateLimit),
    ]
});

/// All gates in priority order
pub fn registry() -> &'static [Box<dyn Gate>] {
    &REGISTRY
}

pub fn gate(id: GateId) -> Option<&'static dyn Gate> {
    registry().iter().find(|g| g.id() == id).map(|g| g.as_ref())
}

/// Gates watching `tool_name`, in priority order
pub fn gates_for_tool(tool_name: &str) -> Vec<&'static dyn Gate> {
    registry()
        .iter()
        .filter(|g| g.id().watches(tool_name))
        .map(|g| g.as_ref())
        .collect()
}

/// Error listing any Tier 1 gate missing from the registry
pub fn verify_registry() -> Result<()> {
    let missing: Vec<&str> = GateId::ALL
        .iter()
        .filter(|id| id.is_tier1())
        .filter(|id| gate(**id).is_none())
        .map(|id| id.module_name())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "Tier 1 safety gate(s) failed to load: {}",
            missing.join(", ")
        ))
    }
}

/// Run a gate, turning a panic into an error
pub fn run_gate(
    gate: &dyn Gate,
    call: &ToolCall,
    state: &mut SessionState,
    ctx: &GateContext<'_>,
) -> Result<GateResult> {
    match catch_unwind(AssertUnwindSafe(|| gate.check(call, state, ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            Err(anyhow!("{}", msg))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Temp hooks/claude dirs plus the context built over them
    pub struct Fixture {
        pub dir: TempDir,
        pub paths: Paths,
        pub toggles: Toggles,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let paths = Paths::under(dir.path());
            std::fs::create_dir_all(&paths.hooks_dir).unwrap();
            Self {
                dir,
                paths,
                toggles: Toggles::default(),
            }
        }

        pub fn with_toggles(mut self, config: serde_json::Value) -> Self {
            self.toggles = Toggles::from_values(config, serde_json::Value::Null);
            self
        }

        pub fn ctx(&self, now: f64) -> GateContext<'_> {
            GateContext::new(&self.paths, &self.toggles, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_and_tiers() {
        let names: Vec<&str> = registry().iter().map(|g| g.id().short_name()).collect();
        assert_eq!(names.first(), Some(&"gate_01"));
        assert_eq!(names.last(), Some(&"gate_11"));
        assert_eq!(names.len(), 17);
        for (gate, id) in registry().iter().zip(GateId::ALL) {
            assert_eq!(gate.id(), id);
        }
        assert!(verify_registry().is_ok());
        assert_eq!(GateId::SaveFix.tier(), 2);
        assert_eq!(GateId::Hindsight.tier(), 3);
    }

    #[test]
    fn test_gates_for_tool() {
        let bash: Vec<GateId> = gates_for_tool("Bash").iter().map(|g| g.id()).collect();
        assert_eq!(
            bash,
            vec![
                GateId::NoDestroy,
                GateId::TestBeforeDeploy,
                GateId::SaveFix,
                GateId::Canary,
                GateId::RateLimit
            ]
        );
        let task: Vec<GateId> = gates_for_tool("Task").iter().map(|g| g.id()).collect();
        assert!(task.contains(&GateId::ModelEnforcement));
        assert!(task.contains(&GateId::MemoryFirst));
        assert!(!task.contains(&GateId::ReadBeforeEdit));
    }

    #[test]
    fn test_name_resolution() {
        assert_eq!(short_gate_name("gates.gate_04_memory_first"), "gate_04");
        assert_eq!(short_gate_name("gate_14"), "gate_14");
        assert_eq!(
            GateId::from_name("gates.gate_17_injection_defense"),
            Some(GateId::InjectionDefense)
        );
        assert_eq!(GateId::from_name("gate_08"), None);
        assert_eq!(GateId::RateLimit.short_name(), "gate_11");
    }

    struct Panicky;

    impl Gate for Panicky {
        fn id(&self) -> GateId {
            GateId::Canary
        }

        fn check(
            &self,
            _call: &ToolCall,
            _state: &mut SessionState,
            _ctx: &GateContext<'_>,
        ) -> Result<GateResult> {
            panic!("boom");
        }
    }

    #[test]
    fn test_run_gate_catches_panic() {
        let fx = test_support::Fixture::new();
        let mut state = SessionState::default();
        let call = ToolCall::pre("Bash", serde_json::json!({"command": "ls"}));
        let err = run_gate(&Panicky, &call, &mut state, &fx.ctx(0.0)).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
