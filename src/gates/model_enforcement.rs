//! Gate 10: model cost guard.
//!
//! Every subagent spawn must name its model. With budget degradation on,
//! spending tiers push spawns toward cheaper models and finally stop them.
//! The role profile picks a model per agent role. Downgrades are reported as
//! advisories; the host's tool input is never rewritten.

use super::{Gate, GateContext, GateId};
use crate::gate_result::GateResult;
use crate::hook::ToolCall;
use crate::state::SessionState;
use anyhow::Result;

const MODEL_GUIDANCE: &str =
    "Add a model parameter: haiku (research/search), sonnet (analysis/testing), opus (complex implementation)";

/// Suppress mismatch warnings once a combination has proven itself
const PROVEN_USES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Planning,
    Research,
    Execution,
    Verification,
}

impl Role {
    pub fn for_agent(subagent_type: &str) -> Option<Self> {
        Some(match subagent_type {
            "Plan" => Self::Planning,
            "Explore" | "researcher" | "claude-code-guide" => Self::Research,
            "builder" | "general-purpose" | "Bash" | "statusline-setup" | "debugger" => {
                Self::Execution
            }
            "stress-tester" | "security" | "perf-analyzer" => Self::Verification,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Research => "research",
            Self::Execution => "execution",
            Self::Verification => "verification",
        }
    }
}

/// Model the named profile assigns to a role; unknown profiles read as balanced
pub fn profile_model(profile: &str, role: Role) -> &'static str {
    use Role::*;
    match (profile, role) {
        ("quality", Planning | Execution) => "opus",
        ("quality", _) => "sonnet",
        ("efficient", Planning) => "opus",
        ("efficient", Verification) => "haiku",
        ("efficient", _) => "sonnet",
        ("lean", Planning) => "opus",
        ("lean", Execution) => "sonnet",
        ("lean", _) => "haiku",
        ("budget", Planning | Execution) => "sonnet",
        ("budget", _) => "haiku",
        (_, Planning) => "opus",
        (_, _) => "sonnet",
    }
}

fn recommended_models(subagent_type: &str) -> Option<&'static [&'static str]> {
    Some(match subagent_type {
        "Explore" | "Bash" | "researcher" | "stress-tester" => &["haiku", "sonnet"],
        "Plan" => &["opus", "sonnet"],
        "general-purpose" | "builder" | "debugger" => &["sonnet", "opus"],
        "security" | "perf-analyzer" => &["sonnet"],
        "claude-code-guide" | "statusline-setup" => &["haiku"],
        _ => return None,
    })
}

fn model_suggestion(subagent_type: &str) -> &'static str {
    match subagent_type {
        "Explore" => "haiku or sonnet (read-only exploration doesn't need opus)",
        "Plan" => "opus or sonnet (planning needs strong reasoning for architecture decisions)",
        "general-purpose" => "sonnet or opus (needs Edit/Write, haiku may lack capability)",
        "Bash" => "haiku or sonnet (command execution doesn't need opus)",
        "builder" => "sonnet or opus (full implementation agent needs Edit/Write)",
        "researcher" => "haiku or sonnet (read-only exploration and analysis)",
        "security" => "sonnet (security auditing needs reasoning, not opus-level)",
        "stress-tester" => "haiku or sonnet (test execution doesn't need opus)",
        "perf-analyzer" => "sonnet (profiling needs reasoning, not opus-level)",
        "debugger" => "sonnet or opus (debugging complex issues may need full power)",
        "claude-code-guide" => "haiku (documentation lookup only, minimal capability needed)",
        "statusline-setup" => "haiku (simple config file edits only)",
        _ => "check model choice",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetTier {
    Normal,
    LowCompute,
    Critical,
    Dead,
}

impl BudgetTier {
    pub fn from_usage(fraction: f64) -> Self {
        if fraction >= 0.95 {
            Self::Dead
        } else if fraction >= 0.80 {
            Self::Critical
        } else if fraction >= 0.40 {
            Self::LowCompute
        } else {
            Self::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::LowCompute => "low_compute",
            Self::Critical => "critical",
            Self::Dead => "dead",
        }
    }
}

/// `1234567` → `1,234,567`
fn thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

pub struct ModelEnforcement;

impl Gate for ModelEnforcement {
    fn id(&self) -> GateId {
        GateId::ModelEnforcement
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || call.tool_name != "Task" {
            return Ok(GateResult::pass(name));
        }

        let description = match call.input_str("description") {
            "" => "sub-agent task",
            d => d,
        };
        let subagent_type = match call.input_str("subagent_type") {
            "" => "unknown",
            s => s,
        };
        let mut model = call.input_str("model").to_string();
        if model.is_empty() {
            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED: Task '{}' ({}) has no explicit model parameter. Without one, it inherits the parent's model (likely opus). {}",
                    name, description, subagent_type, MODEL_GUIDANCE
                ),
            ));
        }

        let mut notes: Vec<String> = Vec::new();

        let budget = ctx.toggles.number("session_token_budget").unwrap_or(0.0);
        if ctx.toggles.flag("budget_degradation") && budget >= 1.0 {
            let limit = budget as u64;
            let used = state.subagent_total_tokens + state.session_token_estimate;
            let usage = used as f64 / limit as f64;
            let tier = BudgetTier::from_usage(usage);
            state.budget_tier = tier.as_str().to_string();
            let pct = (usage * 100.0).round() as i64;

            match tier {
                BudgetTier::Dead => {
                    return Ok(GateResult::block(
                        name,
                        format!(
                            "[{}] BLOCKED [DEAD TIER]: 95%+ of session token budget ({}/{} tokens, {}%). No more sub-agent spawns. Use /wrap-up to end session.",
                            name,
                            thousands(used),
                            thousands(limit),
                            pct
                        ),
                    ));
                }
                BudgetTier::Critical if model != "haiku" => {
                    notes.push(format!(
                        "[{}] CRITICAL TIER: {}% budget used, downgrade {}→haiku ({}/{} tokens)",
                        name,
                        pct,
                        model,
                        thousands(used),
                        thousands(limit)
                    ));
                    model = "haiku".to_string();
                }
                BudgetTier::LowCompute if model == "opus" => {
                    notes.push(format!(
                        "[{}] LOW_COMPUTE TIER: {}% budget used, downgrade opus→sonnet ({}/{} tokens)",
                        name,
                        pct,
                        thousands(used),
                        thousands(limit)
                    ));
                    model = "sonnet".to_string();
                }
                _ => {}
            }
        }

        if let Some(role) = Role::for_agent(subagent_type) {
            let profile = ctx
                .toggles
                .string("model_profile")
                .unwrap_or_else(|| "balanced".to_string());
            let target = profile_model(&profile, role);
            if target != model {
                notes.push(format!(
                    "[{}] PROFILE '{}': {}→{} ({} role) for {} agent '{}'",
                    name,
                    profile,
                    model,
                    target,
                    role.as_str(),
                    subagent_type,
                    description
                ));
                model = target.to_string();
            }
        }

        let usage_key = format!("{}:{}", subagent_type, model);
        let uses = {
            let count = state.model_agent_usage.entry(usage_key).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(recommended) = recommended_models(subagent_type) {
            if !recommended.contains(&model.as_str()) && uses < PROVEN_USES {
                notes.push(format!(
                    "[{}] WARNING: Task '{}' uses {} agent with model '{}' (used {}x). Recommended: {}",
                    name,
                    description,
                    subagent_type,
                    model,
                    uses,
                    model_suggestion(subagent_type)
                ));
            }
        }

        if notes.is_empty() {
            Ok(GateResult::pass(name))
        } else {
            Ok(GateResult::warn(name, notes.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::test_support::Fixture;
    use serde_json::json;

    fn task(input: serde_json::Value) -> ToolCall {
        ToolCall::pre("Task", input)
    }

    #[test]
    fn test_blocks_missing_model() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        let call = task(json!({"description": "scan repo", "subagent_type": "Explore"}));
        let result = ModelEnforcement.check(&call, &mut state, &fx.ctx(0.0)).unwrap();
        assert!(result.blocked);
        assert!(result.message.contains("Task 'scan repo' (Explore) has no explicit model"));
    }

    #[test]
    fn test_profile_downgrade_is_advisory() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        let call = task(json!({"description": "fix", "subagent_type": "builder", "model": "opus"}));
        let result = ModelEnforcement.check(&call, &mut state, &fx.ctx(0.0)).unwrap();
        assert!(!result.blocked);
        assert!(result
            .message
            .contains("PROFILE 'balanced': opus→sonnet (execution role) for builder agent 'fix'"));
        assert_eq!(state.model_agent_usage["builder:sonnet"], 1);
    }

    #[test]
    fn test_budget_tiers() {
        let fx = Fixture::new().with_toggles(json!({
            "budget_degradation": true,
            "session_token_budget": 100000,
            "model_profile": "quality",
        }));
        let mut state = SessionState::new_at(0.0);
        state.session_token_estimate = 50_000;
        let call = task(json!({"subagent_type": "Plan", "model": "opus"}));
        let result = ModelEnforcement.check(&call, &mut state, &fx.ctx(0.0)).unwrap();
        assert_eq!(state.budget_tier, "low_compute");
        assert!(result.message.contains("LOW_COMPUTE TIER: 50% budget used"));

        state.subagent_total_tokens = 46_000;
        let result = ModelEnforcement.check(&call, &mut state, &fx.ctx(0.0)).unwrap();
        assert!(result.blocked);
        assert!(result.message.contains("(96,000/100,000 tokens, 96%)"));
        assert_eq!(state.budget_tier, "dead");
    }

    #[test]
    fn test_mismatch_warning_suppressed_after_three_uses() {
        let fx = Fixture::new();
        let mut state = SessionState::new_at(0.0);
        let call = task(json!({"subagent_type": "custom-agent", "model": "opus"}));
        assert!(ModelEnforcement.check(&call, &mut state, &fx.ctx(0.0)).unwrap().message.is_empty());

        state.model_agent_usage.insert("security:haiku".into(), 2);
        let fx = Fixture::new().with_toggles(json!({"model_profile": "budget"}));
        let call = task(json!({"subagent_type": "security", "model": "haiku"}));
        // budget profile keeps haiku for verification; third use is proven
        let result = ModelEnforcement.check(&call, &mut state, &fx.ctx(0.0)).unwrap();
        assert!(result.message.is_empty());
    }

    #[test]
    fn test_thousands() {
        assert_eq!(thousands(0), "0");
        assert_eq!(thousands(999), "999");
        assert_eq!(thousands(1_234_567), "1,234,567");
    }
}
