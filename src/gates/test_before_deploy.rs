//! Gate 3: test before deploy.
//!
//! Deploy-like commands need a passing test run in the last 30 minutes.

use super::{Gate, GateContext, GateId};
use crate::gate_result::GateResult;
use crate::hook::ToolCall;
use crate::state::SessionState;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

pub const TEST_FRESHNESS_WINDOW: f64 = 1800.0;

static DEPLOY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\bscp\b.*\b\d+\.\d+\.\d+\.\d+\b", "remote copy"),
        (r"\bscp\b.*@.*:", "remote copy"),
        (r"\brsync\b.*:", "remote sync"),
        (r"\bdocker\s+push\b", "container"),
        (r"\bkubectl\s+apply\b", "kubernetes"),
        (r"\bkubectl\s+rollout\b", "kubernetes"),
        (r"\bgit\s+push\b.*\b(main|master|prod|production)\b", "git production"),
        (r"\bssh\b.*deploy", "remote deploy"),
        (r"\bfab\s+deploy\b", "fabric"),
        (r"\bansible-playbook\b", "ansible"),
        (r"\bcaprover\b", "caprover"),
        (r"\bheroku\s+push\b", "heroku"),
        (r"\bfly\s+deploy\b", "fly.io"),
        (r"\bnpm\s+publish\b", "package publish"),
        (r"\bcargo\s+publish\b", "package publish"),
        (r"\btwine\s+upload\b", "package publish"),
        (r"\bgcloud\s+(app\s+deploy|run\s+deploy)\b", "gcloud"),
        (r"\baws\s+s3\s+sync\b", "aws"),
        (r"\bhelm\s+(upgrade|install)\b", "helm"),
        (r"\bterraform\s+apply\b", "terraform"),
        (r"\bpulumi\s+up\b", "pulumi"),
        (r"\bserverless\s+deploy\b", "serverless"),
        (r"\bcdk\s+deploy\b", "aws cdk"),
        (r"\bnpm\s+run\s+deploy\b", "npm deploy"),
        (r"\byarn\s+deploy\b", "yarn deploy"),
        (r"\bvercel\b.*--prod\b", "vercel"),
        (r"\bnetlify\s+deploy\b.*--prod\b", "netlify"),
        (r"\brailway\s+up\b", "railway"),
        (r"\bamplify\s+publish\b", "aws amplify"),
    ]
    .into_iter()
    .filter_map(|(p, category)| {
        Regex::new(&format!("(?i){}", p))
            .ok()
            .map(|re| (re, category))
    })
    .collect()
});

/// Deploy category of `command`, if it deploys
pub fn deploy_category(command: &str) -> Option<&'static str> {
    DEPLOY_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map(|(_, category)| *category)
}

/// Best guess at the command that runs this project's tests
fn detect_test_framework(state: &SessionState) -> Option<&'static str> {
    let last = state.last_test_command.as_str();
    let framework = if last.contains("test_framework") {
        "python3 test_framework.py"
    } else if last.contains("pytest") {
        "pytest"
    } else if last.contains("npm test") {
        "npm test"
    } else if last.contains("cargo test") {
        "cargo test"
    } else if last.contains("go test") {
        "go test"
    } else if last.contains("make test") {
        "make test"
    } else if state.tool_stats.get("Bash").map(|s| s.count).unwrap_or(0) > 0 {
        "pytest"
    } else {
        return None;
    };
    Some(framework)
}

pub struct TestBeforeDeploy;

impl Gate for TestBeforeDeploy {
    fn id(&self) -> GateId {
        GateId::TestBeforeDeploy
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || call.tool_name != "Bash" {
            return Ok(GateResult::pass(name));
        }
        let Some(category) = deploy_category(call.command()) else {
            return Ok(GateResult::pass(name));
        };

        let elapsed = ctx.now - state.last_test_run;
        if elapsed > TEST_FRESHNESS_WINDOW {
            let hint = detect_test_framework(state)
                .map(|f| format!(" Try: {}", f))
                .unwrap_or_default();
            let minutes_ago = (elapsed / 60.0) as i64;
            let msg = if state.last_test_run > 0.0 && minutes_ago > 0 {
                format!(
                    "[{}] BLOCKED: Deploy ({}) attempted but tests last ran {} minutes ago. Run tests before deploying.{}",
                    name, category, minutes_ago, hint
                )
            } else {
                format!(
                    "[{}] BLOCKED: Deploy ({}) attempted but no tests have been run this session. Run tests before deploying.{}",
                    name, category, hint
                )
            };
            return Ok(GateResult::block(name, msg));
        }

        if let Some(code) = state.last_test_exit_code.filter(|c| *c != 0) {
            return Ok(GateResult::block(
                name,
                format!(
                    "[{}] BLOCKED: Deploy ({}) attempted but last test run failed (exit code: {}). Fix tests before deploying.",
                    name, category, code
                ),
            ));
        }

        Ok(GateResult::pass(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::test_support::Fixture;
    use serde_json::json;

    const NOW: f64 = 100_000.0;

    fn check(state: &mut SessionState, command: &str) -> GateResult {
        let fx = Fixture::new();
        let call = ToolCall::pre("Bash", json!({"command": command}));
        TestBeforeDeploy.check(&call, state, &fx.ctx(NOW)).unwrap()
    }

    #[test]
    fn test_deploy_detection() {
        assert_eq!(deploy_category("docker push org/app:1"), Some("container"));
        assert_eq!(deploy_category("git push origin main"), Some("git production"));
        assert_eq!(deploy_category("scp build.tar deploy@host:/srv"), Some("remote copy"));
        assert_eq!(deploy_category("git push origin feature/x"), None);
        assert_eq!(deploy_category("cargo build"), None);
    }

    #[test]
    fn test_blocks_without_tests() {
        let mut state = SessionState::new_at(NOW - 10.0);
        let result = check(&mut state, "cargo publish");
        assert!(result.blocked);
        assert!(result.message.contains("no tests have been run this session"));
    }

    #[test]
    fn test_blocks_stale_tests_with_hint() {
        let mut state = SessionState::new_at(NOW - 4000.0);
        state.last_test_run = NOW - 3600.0;
        state.last_test_command = "cargo test --all".into();
        let result = check(&mut state, "kubectl apply -f deploy.yaml");
        assert!(result.blocked);
        assert!(result.message.contains("tests last ran 60 minutes ago"));
        assert!(result.message.ends_with("Try: cargo test"));
    }

    #[test]
    fn test_blocks_failed_tests_and_allows_passing() {
        let mut state = SessionState::new_at(NOW - 100.0);
        state.last_test_run = NOW - 60.0;
        state.last_test_exit_code = Some(1);
        let result = check(&mut state, "npm publish");
        assert!(result.message.contains("exit code: 1"));

        state.last_test_exit_code = Some(0);
        assert!(!check(&mut state, "npm publish").blocked);
    }
}
