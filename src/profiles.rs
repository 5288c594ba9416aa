//! Security profiles: per-gate enforcement modes.
//!
//! `strict` and `balanced` leave every gate blocking. `permissive` and
//! `refactor` downgrade selected gates to advisory and disable the
//! confidence check. Tier 1 gates always block.

use crate::gates::GateId;
use serde::{Deserialize, Serialize};

/// How a gate's block is applied under the active profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    Block,
    Warn,
    Disabled,
}

impl GateMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Warn => "warn",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    Strict,
    #[default]
    Balanced,
    Permissive,
    Refactor,
}

impl SecurityProfile {
    /// Unknown or empty names fall back to `balanced`
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "strict" => Self::Strict,
            "permissive" => Self::Permissive,
            "refactor" => Self::Refactor,
            _ => Self::Balanced,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Balanced => "balanced",
            Self::Permissive => "permissive",
            Self::Refactor => "refactor",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Strict => "All gates active with maximum sensitivity. No downgrades.",
            Self::Balanced => "Standard behavior. Default profile for most sessions.",
            Self::Permissive => {
                "Reduced friction for exploratory work. Non-tier-1 gates advisory only."
            }
            Self::Refactor => {
                "Reduced friction for mechanical bulk refactoring. Relaxes memory/save gates."
            }
        }
    }

    fn warn_gates(&self) -> &'static [GateId] {
        match self {
            Self::Strict | Self::Balanced => &[],
            Self::Permissive => &[
                GateId::MemoryFirst,
                GateId::ProofBeforeFixed,
                GateId::SaveFix,
                GateId::CriticalFileGuard,
                GateId::StrategyBan,
                GateId::ModelEnforcement,
                GateId::RateLimit,
                GateId::WorkspaceIsolation,
                GateId::CausalChain,
                GateId::CodeQuality,
                GateId::InjectionDefense,
            ],
            Self::Refactor => &[
                GateId::MemoryFirst,
                GateId::SaveFix,
                GateId::ModelEnforcement,
            ],
        }
    }

    fn disabled_gates(&self) -> &'static [GateId] {
        match self {
            Self::Strict | Self::Balanced => &[],
            Self::Permissive | Self::Refactor => &[GateId::ConfidenceCheck],
        }
    }

    pub fn gate_mode(&self, gate: GateId) -> GateMode {
        if gate.is_tier1() {
            return GateMode::Block;
        }
        if self.disabled_gates().contains(&gate) {
            GateMode::Disabled
        } else if self.warn_gates().contains(&gate) {
            GateMode::Warn
        } else {
            GateMode::Block
        }
    }

    /// Mode for a gate given by any of its names; unknown gates block
    pub fn gate_mode_for_name(&self, name: &str) -> GateMode {
        GateId::from_name(name)
            .map(|id| self.gate_mode(id))
            .unwrap_or(GateMode::Block)
    }

    pub fn should_skip(&self, gate: GateId) -> bool {
        self.gate_mode(gate) == GateMode::Disabled
    }
}

impl std::fmt::Display for SecurityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_and_balanced_block_everything() {
        for profile in [SecurityProfile::Strict, SecurityProfile::Balanced] {
            for id in GateId::ALL {
                assert_eq!(profile.gate_mode(id), GateMode::Block);
            }
        }
    }

    #[test]
    fn test_permissive_modes() {
        let p = SecurityProfile::Permissive;
        assert_eq!(p.gate_mode(GateId::ProofBeforeFixed), GateMode::Warn);
        assert_eq!(p.gate_mode(GateId::ConfidenceCheck), GateMode::Disabled);
        assert_eq!(p.gate_mode(GateId::Hindsight), GateMode::Block);
        assert_eq!(p.gate_mode(GateId::NoDestroy), GateMode::Block);
        assert!(p.should_skip(GateId::ConfidenceCheck));
    }

    #[test]
    fn test_refactor_modes() {
        let p = SecurityProfile::Refactor;
        assert_eq!(p.gate_mode_for_name("gates.gate_04_memory_first"), GateMode::Warn);
        assert_eq!(p.gate_mode_for_name("gate_05"), GateMode::Block);
        assert_eq!(p.gate_mode_for_name("gate_14_confidence_check"), GateMode::Disabled);
        assert_eq!(p.gate_mode_for_name("gate_99"), GateMode::Block);
    }

    #[test]
    fn test_unknown_profile_is_balanced() {
        assert_eq!(SecurityProfile::parse("yolo"), SecurityProfile::Balanced);
        assert_eq!(SecurityProfile::parse(""), SecurityProfile::Balanced);
        assert_eq!(SecurityProfile::parse(" Strict "), SecurityProfile::Strict);
    }
}
