//! torus-daemon - runs the enforcer daemon in the foreground.
//!
//! Same as `torus daemon start --foreground`; session start scripts launch
//! this binary directly and stop it with SIGTERM via the PID file.

use anyhow::Result;
use torus::config::Config;
use torus::daemon::DaemonServer;
use torus::logging::{self, LogTarget};
use torus::metrics;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;
    let paths = config.paths();
    logging::init(&config.logging, LogTarget::Stderr)?;
    metrics::install();

    DaemonServer::with_paths(&config, paths.clone()).run().await?;
    metrics::global().flush_to(&paths.metrics_file())
}
