//! torus-shim - PreToolUse entry point with a daemon fast path.
//!
//! Forwards the hook payload to the enforcer daemon when its socket exists,
//! re-encoded as a single JSON line. Payloads that do not parse and any
//! socket failure fall back to inline enforcement, so a missing or wedged
//! daemon never changes the decision.

use std::io::Read;
use std::time::Duration;
use torus::config::Config;
use torus::daemon;
use torus::enforcer::Enforcer;
use torus::{logging, metrics};

fn main() {
    dotenvy::dotenv().ok();
    let config = Config::load().unwrap_or_default();
    let paths = config.paths();
    logging::init_for_hook(&config.logging, &paths);

    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        tracing::warn!(error = %e, "failed to read stdin");
    }

    if paths.enforcer_socket().exists() {
        let timeout = Duration::from_millis(config.daemon.client_timeout_ms);
        match daemon::request(&paths, &raw, timeout) {
            Ok(outcome) => {
                outcome.emit();
                std::process::exit(outcome.exit_code);
            }
            Err(e) => tracing::info!(error = %e, "daemon unavailable, enforcing inline"),
        }
    }

    metrics::install();
    let outcome = Enforcer::with_paths(&config, paths.clone()).handle_raw(&raw);
    if let Err(e) = metrics::global().flush_to(&paths.metrics_file()) {
        tracing::debug!(error = %e, "metrics flush failed");
    }
    outcome.emit();
    std::process::exit(outcome.exit_code);
}
