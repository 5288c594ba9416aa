//! Tool-mix analysis every tenth call.
//!
//! Looks at the session's per-tool counts for one tool dominating (stuck),
//! edits far outpacing runs (churn), or a balanced read/edit/run mix (healthy).

use crate::state::SessionState;

pub const STUCK_THRESHOLD: f64 = 0.7;
pub const EVERY_N_CALLS: u64 = 10;
const MIN_CALLS: u64 = 10;
const NEUTRAL_SCORE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct ChainVerdict {
    /// "stuck", "churn", "healthy", or empty when nothing stands out
    pub pattern: &'static str,
    pub score: f64,
    pub message: String,
}

fn count_of(state: &SessionState, tools: &[&str]) -> u64 {
    tools
        .iter()
        .map(|t| state.tool_call_counts.get(*t).copied().unwrap_or(0))
        .sum()
}

/// `None` off-cycle or before enough calls have been seen
pub fn evaluate(state: &mut SessionState) -> Option<ChainVerdict> {
    if state.tool_call_count % EVERY_N_CALLS != 0 {
        return None;
    }
    let total = state.total_tool_calls;
    if total < MIN_CALLS {
        return None;
    }
    let totalf = total as f64;

    let mut verdict = ChainVerdict {
        pattern: "",
        score: NEUTRAL_SCORE,
        message: String::new(),
    };

    if let Some((tool, count)) = state.tool_call_counts.iter().max_by_key(|(_, c)| **c) {
        let ratio = *count as f64 / totalf;
        if ratio >= STUCK_THRESHOLD {
            verdict = ChainVerdict {
                pattern: "stuck",
                score: 0.2,
                message: format!(
                    "Stuck loop: {} is {:.0}% of last {} calls",
                    tool,
                    ratio * 100.0,
                    total
                ),
            };
        }
    }

    if verdict.pattern.is_empty() {
        let edits = count_of(state, &["Edit", "Write", "NotebookEdit"]);
        let runs = count_of(state, &["Bash"]);
        let edit_ratio = edits as f64 / totalf;
        if edits > 0 && edit_ratio > 0.6 && (runs as f64) < edits as f64 * 0.3 {
            verdict = ChainVerdict {
                pattern: "churn",
                score: 0.3,
                message: format!(
                    "Edit churn: {} edits vs {} bash calls (edit ratio {:.0}%)",
                    edits,
                    runs,
                    edit_ratio * 100.0
                ),
            };
        }
    }

    if verdict.pattern.is_empty() {
        let reads = count_of(state, &["Read", "Grep", "Glob"]);
        let edits = count_of(state, &["Edit", "Write"]);
        let runs = count_of(state, &["Bash"]);
        if reads > 0
            && edits > 0
            && runs > 0
            && reads as f64 >= edits as f64 * 0.5
            && runs as f64 >= edits as f64 * 0.3
        {
            verdict = ChainVerdict {
                pattern: "healthy",
                score: 0.9,
                message: format!("Healthy pattern: {}R/{}E/{}T", reads, edits, runs),
            };
        }
    }

    state.mentor_chain_pattern = verdict.pattern.to_string();
    state.mentor_chain_score = verdict.score;
    tracing::debug!(pattern = verdict.pattern, score = verdict.score, "outcome chain");
    Some(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(counts: &[(&str, u64)]) -> SessionState {
        let mut state = SessionState::new_at(0.0);
        for (tool, n) in counts {
            state.tool_call_counts.insert(tool.to_string(), *n);
        }
        state.total_tool_calls = counts.iter().map(|(_, n)| n).sum();
        state.tool_call_count = state.total_tool_calls;
        state
    }

    #[test]
    fn test_off_cycle_and_warmup() {
        let mut state = state_with(&[("Read", 5), ("Edit", 5)]);
        state.tool_call_count = 11;
        assert!(evaluate(&mut state).is_none());
        let mut state = state_with(&[("Read", 0)]);
        assert!(evaluate(&mut state).is_none());
    }

    #[test]
    fn test_stuck() {
        let mut state = state_with(&[("Bash", 16), ("Read", 4)]);
        let verdict = evaluate(&mut state).unwrap();
        assert_eq!(verdict.pattern, "stuck");
        assert_eq!(verdict.message, "Stuck loop: Bash is 80% of last 20 calls");
        assert_eq!(state.mentor_chain_score, 0.2);
    }

    #[test]
    fn test_churn() {
        let mut state = state_with(&[("Edit", 13), ("Read", 5), ("Bash", 2)]);
        let verdict = evaluate(&mut state).unwrap();
        assert_eq!(verdict.pattern, "churn");
        assert_eq!(state.mentor_chain_pattern, "churn");
    }

    #[test]
    fn test_healthy_and_neutral() {
        let mut state = state_with(&[("Read", 8), ("Edit", 6), ("Bash", 6)]);
        let verdict = evaluate(&mut state).unwrap();
        assert_eq!(verdict.pattern, "healthy");
        assert_eq!(verdict.message, "Healthy pattern: 8R/6E/6T");

        let mut state = state_with(&[("Read", 6), ("Grep", 4)]);
        let verdict = evaluate(&mut state).unwrap();
        assert_eq!(verdict.pattern, "");
        assert_eq!(verdict.score, 0.7);
    }
}
