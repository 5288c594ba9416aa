//! `torus` command line.
//!
//! `torus enforce` and `torus track` are the PreToolUse and PostToolUse hook
//! entry points. Everything else is administration: the enforcer daemon,
//! session state, the audit trail, breakers, the Q-table and metrics.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use torus::audit::AuditLog;
use torus::breaker::{GateBreaker, ServiceBreaker};
use torus::config::{Config, Paths};
use torus::daemon::{self, DaemonServer, DaemonStatus};
use torus::enforcer::Enforcer;
use torus::logging::{self, LogTarget};
use torus::memory_client::MemoryClient;
use torus::metrics;
use torus::router::load_qtable;
use torus::state::effectiveness::load_gate_effectiveness;
use torus::state::now_secs;
use torus::state::store::{cleanup_all_states, list_sessions, load_state, reset_state};
use torus::tracker::Tracker;
use torus::HookOutcome;

#[derive(Parser)]
#[command(name = "torus")]
#[command(version, about = "Tool-call gate enforcement for coding assistant hooks", long_about = None)]
struct Cli {
    /// Config file, replacing ~/.torus and .torus discovery
    #[arg(short, long, global = true, env = "TORUS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Hooks directory (state, sockets, audit trail)
    #[arg(long, global = true, value_name = "DIR")]
    hooks_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// PreToolUse hook: gate a tool call read from stdin
    Enforce,
    /// PostToolUse hook: record a completed tool call read from stdin
    Track,
    /// Manage the enforcer daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Inspect or reset session state
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
    /// Query and maintain the audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    /// Circuit breaker status
    Breaker {
        #[command(subcommand)]
        command: BreakerCommand,
    },
    /// Talk to the memory worker
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Print the persisted gate routing Q-table and gate effectiveness
    Qtable,
    /// Print collected metrics
    Metrics {
        /// Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
        /// Write the snapshot to metrics.json as well
        #[arg(long)]
        export: bool,
    },
}

#[derive(Subcommand)]
enum DaemonCommand {
    Start {
        /// Run in this process instead of detaching
        #[arg(long)]
        foreground: bool,
    },
    Stop {
        #[arg(long, default_value = "5")]
        timeout_secs: u64,
    },
    Status,
}

#[derive(Subcommand)]
enum StateCommand {
    Show {
        #[arg(default_value = "main")]
        session: String,
    },
    Reset {
        #[arg(default_value = "main")]
        session: String,
    },
    /// Delete every session state file
    Cleanup,
    List,
}

#[derive(Subcommand)]
enum AuditCommand {
    Recent {
        #[arg(long)]
        gate: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Blocks by gate and tool over a time window
    Summary {
        #[arg(long, default_value = "24")]
        hours: i64,
    },
    /// Write per-day summary.json files
    Compact,
    /// Delete audit files past retention
    Cleanup {
        #[arg(long)]
        days: Option<u64>,
    },
}

#[derive(Subcommand)]
enum BreakerCommand {
    Status,
    Reset {
        /// Gate module name or service name
        name: String,
        /// Reset a service breaker rather than a gate breaker
        #[arg(long)]
        service: bool,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Ping the worker and count a collection
    Status {
        #[arg(long, default_value = "knowledge")]
        collection: String,
    },
    Query {
        text: String,
        #[arg(long, default_value = "knowledge")]
        collection: String,
        #[arg(short, long, default_value = "5")]
        n: u32,
    },
    Get {
        ids: Vec<String>,
        #[arg(long, default_value = "knowledge")]
        collection: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long, default_value = "knowledge")]
        collection: String,
    },
    /// Ask the worker to ingest the observation capture queue
    Flush,
    Backup,
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(dir) = &cli.hooks_dir {
        config.paths.hooks_dir = Some(dir.clone());
    }
    Ok(config)
}

fn read_stdin() -> String {
    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        tracing::warn!(error = %e, "failed to read stdin");
    }
    raw
}

/// Hooks never fail on configuration: a broken config file falls back to
/// defaults with a warning line
fn hook_config(cli: &Cli) -> (Config, Option<String>) {
    match load_config(cli) {
        Ok(config) => (config, None),
        Err(e) => {
            let mut config = Config::default();
            config.paths.hooks_dir = cli.hooks_dir.clone();
            (config, Some(format!("[TORUS] Warning: {:#}; using defaults", e)))
        }
    }
}

fn run_hook(cli: &Cli, pre: bool) -> ! {
    let (config, warning) = hook_config(cli);
    let paths = config.paths();
    logging::init_for_hook(&config.logging, &paths);
    metrics::install();

    let raw = read_stdin();
    let mut outcome = if pre {
        Enforcer::with_paths(&config, paths.clone()).handle_raw(&raw)
    } else {
        Tracker::with_paths(&config, paths.clone()).handle_raw(&raw)
    };
    if let Some(warning) = warning {
        outcome.eprintln(warning);
    }
    if let Err(e) = metrics::global().flush_to(&paths.metrics_file()) {
        tracing::debug!(error = %e, "metrics flush failed");
    }
    finish(outcome)
}

fn finish(outcome: HookOutcome) -> ! {
    outcome.emit();
    std::process::exit(outcome.exit_code)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn daemon_command(config: &Config, paths: &Paths, command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Start { foreground: true } => {
            metrics::install();
            let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
            runtime.block_on(DaemonServer::with_paths(config, paths.clone()).run())?;
            metrics::global().flush_to(&paths.metrics_file())
        }
        DaemonCommand::Start { foreground: false } => {
            if let DaemonStatus::Running { pid } = daemon::status(paths) {
                println!("Daemon already running (PID {})", pid);
                return Ok(());
            }
            let exe = std::env::current_exe().context("Failed to locate torus binary")?;
            let mut cmd = std::process::Command::new(exe);
            cmd.args(["daemon", "start", "--foreground"])
                .env("TORUS_HOOKS_DIR", &paths.hooks_dir)
                .env("TORUS_CLAUDE_DIR", &paths.claude_dir)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
            let child = cmd.spawn().context("Failed to spawn daemon")?;

            for _ in 0..30 {
                if daemon::ping(paths, Duration::from_millis(200)) {
                    println!("Daemon started (PID {})", child.id());
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            bail!("Daemon did not come up on {}", paths.enforcer_socket().display())
        }
        DaemonCommand::Stop { timeout_secs } => {
            if daemon::stop(paths, Duration::from_secs(timeout_secs))? {
                println!("Daemon stopped");
            } else {
                println!("Daemon not running");
            }
            Ok(())
        }
        DaemonCommand::Status => {
            match daemon::status(paths) {
                DaemonStatus::Running { pid } => {
                    println!("running (PID {}, socket {})", pid, paths.enforcer_socket().display())
                }
                DaemonStatus::Unresponsive { pid } => println!("unresponsive (PID {})", pid),
                DaemonStatus::Stopped => println!("stopped"),
            }
            Ok(())
        }
    }
}

fn state_command(paths: &Paths, command: StateCommand) -> Result<()> {
    match command {
        StateCommand::Show { session } => print_json(&load_state(paths, &session)),
        StateCommand::Reset { session } => {
            reset_state(paths, &session)?;
            println!("Reset state for session {}", session);
            Ok(())
        }
        StateCommand::Cleanup => {
            println!("Removed {} state files", cleanup_all_states(paths));
            Ok(())
        }
        StateCommand::List => {
            for session in list_sessions(paths) {
                println!("{}", session);
            }
            Ok(())
        }
    }
}

fn audit_command(config: &Config, paths: &Paths, command: AuditCommand) -> Result<()> {
    let audit = AuditLog::new(paths, &config.audit);
    match command {
        AuditCommand::Recent { gate, limit } => {
            for entry in audit.recent_decisions(gate.as_deref(), limit) {
                println!(
                    "{} {:<6} {:<32} {:<14} {}",
                    entry.timestamp, entry.decision, entry.gate, entry.tool, entry.reason
                );
            }
            Ok(())
        }
        AuditCommand::Summary { hours } => {
            print_json(&audit.block_summary(hours, chrono::Utc::now()))
        }
        AuditCommand::Compact => {
            let days = audit.compact()?;
            println!("Compacted {} day(s)", days.len());
            Ok(())
        }
        AuditCommand::Cleanup { days } => {
            let report = audit.cleanup_old_files(days.unwrap_or(config.audit.retention_days));
            println!("Deleted {} file(s), {} error(s)", report.deleted, report.errors);
            Ok(())
        }
    }
}

fn breaker_command(paths: &Paths, command: BreakerCommand) -> Result<()> {
    let gates = GateBreaker::new(paths);
    let services = ServiceBreaker::new(paths);
    match command {
        BreakerCommand::Status => {
            let now = now_secs();
            print_json(&serde_json::json!({
                "gates": gates.all(),
                "services": services.all(now),
            }))
        }
        BreakerCommand::Reset { name, service } => {
            if service {
                services.reset(&name);
            } else {
                gates.reset(&name);
            }
            println!("Reset breaker {}", name);
            Ok(())
        }
    }
}

fn memory_command(config: &Config, paths: &Paths, command: MemoryCommand) -> Result<()> {
    let memory = MemoryClient::new(paths, &config.memory);
    match command {
        MemoryCommand::Status { collection } => {
            memory.ping()?;
            let count = memory.count(&collection)?;
            println!("memory worker up, {} entries in {}", count, collection);
            Ok(())
        }
        MemoryCommand::Query { text, collection, n } => {
            print_json(&memory.query(&collection, &[text.as_str()], n, None)?)
        }
        MemoryCommand::Get { ids, collection, limit } => {
            let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
            let ids = (!ids.is_empty()).then_some(ids.as_slice());
            print_json(&memory.get(&collection, ids, limit, None)?)
        }
        MemoryCommand::Delete { ids, collection } => {
            let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
            print_json(&memory.delete(&collection, &ids)?)
        }
        MemoryCommand::Flush => print_json(&memory.flush_queue()?),
        MemoryCommand::Backup => print_json(&memory.backup()?),
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Enforce => run_hook(&cli, true),
        Commands::Track => run_hook(&cli, false),
        _ => {}
    }

    let config = load_config(&cli)?;
    let paths = config.paths();
    logging::init(&config.logging, LogTarget::Stderr)?;

    match cli.command {
        Commands::Enforce | Commands::Track => Ok(()),
        Commands::Daemon { command } => daemon_command(&config, &paths, command),
        Commands::State { command } => state_command(&paths, command),
        Commands::Audit { command } => audit_command(&config, &paths, command),
        Commands::Breaker { command } => breaker_command(&paths, command),
        Commands::Memory { command } => memory_command(&config, &paths, command),
        Commands::Qtable => print_json(&serde_json::json!({
            "qtable": load_qtable(&paths)?,
            "effectiveness": load_gate_effectiveness(&paths),
        })),
        Commands::Metrics { prometheus, export } => {
            let snapshot = metrics::load_snapshot(&paths.metrics_file());
            if export {
                metrics::global().flush_to(&paths.metrics_file())?;
                println!("Exported {}", paths.metrics_file().display());
            }
            if prometheus {
                let collector = metrics::MetricsCollector::new();
                collector.replay(&snapshot);
                print!("{}", collector.prometheus_metrics());
                Ok(())
            } else {
                print_json(&snapshot)
            }
        }
    }
}
