//! Gate 7: critical file guard.
//!
//! High-risk files (auth, payments, credentials, CI, the hook framework
//! itself) need a memory query within the last five minutes before an edit.

use super::{Gate, GateContext, GateId};
use crate::gate_result::{GateResult, Severity};
use crate::hook::{basename, ToolCall};
use crate::state::SessionState;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

const FRESHNESS_WINDOW: f64 = 300.0;

static CRITICAL_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(models|schema|migration).*\.py$", "Database models"),
        (r"(auth|login|session|jwt|oauth).*\.py$", "Authentication"),
        (r"(payment|billing|stripe|charge).*\.py$", "Payment processing"),
        (r"\.env$", "Environment variables"),
        (r"docker-compose.*\.ya?ml$", "Docker orchestration"),
        (r"Dockerfile$", "Docker build"),
        (r"\.github/workflows/.*\.ya?ml$", "CI/CD pipeline"),
        (r"(nginx|apache|caddy).*\.conf$", "Web server config"),
        (r"(settings|config)\.py$", "App settings"),
        (r"manage\.py$", "Django management"),
        (r"requirements\.txt$", "Python dependencies"),
        (r"package\.json$", "Node dependencies"),
        (r"Cargo\.toml$", "Rust dependencies"),
        (r"\.ssh/", "SSH directory"),
        (r"authorized_keys$", "SSH authorized keys"),
        (r"id_(rsa|ed25519|ecdsa|dsa)(\.pub)?$", "SSH key files"),
        (r"sudoers", "Sudo configuration"),
        (r"crontab$", "Cron schedule"),
        (r"cron\.d/", "Cron directory"),
        (r"\.pem$", "PEM certificates"),
        (r"\.key$", "Private key files"),
        (r"\.pgpass$", "PostgreSQL password file"),
        (r"\.aws/credentials$", "AWS credentials"),
        (r"\.docker/config\.json$", "Docker auth config"),
        (r"sudoers\.d/", "Sudo rules directory"),
        (r"\.netrc$", "FTP/HTTP password file"),
        (r"\.npmrc$", "npm auth tokens"),
        (r"\.pypirc$", "PyPI auth tokens"),
        (r"hooks/torus\.toml$", "Enforcer config"),
        (r"hooks/config\.json$", "Gate toggles"),
        (r"hooks/gates/gate_\d+.*\.py$", "Gate file"),
        (r"hooks/\.circuit_breaker(_state)?\.json$", "Circuit breaker state"),
        (r"hooks/\.gate_qtable\.json$", "Gate routing table"),
        (r"hooks/state_[^/]*\.json$", "Session state"),
    ]
    .into_iter()
    .filter_map(|(p, category)| {
        Regex::new(&format!("(?i){}", p))
            .ok()
            .map(|re| (re, category))
    })
    .collect()
});

/// Category of a critical path, if it is one
pub fn critical_category(file_path: &str) -> Option<&'static str> {
    CRITICAL_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(file_path))
        .map(|(_, category)| *category)
}

pub struct CriticalFileGuard;

impl Gate for CriticalFileGuard {
    fn id(&self) -> GateId {
        GateId::CriticalFileGuard
    }

    fn check(
        &self,
        call: &ToolCall,
        state: &mut SessionState,
        ctx: &GateContext<'_>,
    ) -> Result<GateResult> {
        let name = self.id().label();
        if !call.is_pre() || !call.is_edit_tool() {
            return Ok(GateResult::pass(name));
        }
        let file_path = call.target_path();
        let Some(category) = critical_category(file_path) else {
            return Ok(GateResult::pass(name));
        };

        if ctx.now - ctx.memory_last_queried(state) <= FRESHNESS_WINDOW {
            return Ok(GateResult::pass(name));
        }
        Ok(GateResult::block(
            name,
            format!(
                "[{}] BLOCKED: '{}' is a critical file ({}). Query memory about this file/component before editing. Use search_knowledge() first.",
                name,
                basename(file_path),
                category
            ),
        )
        .with_severity(Severity::Critical))
    }
}
