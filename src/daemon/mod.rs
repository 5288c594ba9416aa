//! Enforcer daemon.
//!
//! Keeps one [`Enforcer`] warm behind `.enforcer.sock` so gated tool calls
//! skip process start-up. Protocol is one NDJSON request (the raw hook JSON)
//! answered by one NDJSON [`HookOutcome`]. The shim falls back to inline
//! enforcement whenever the daemon cannot answer.
//!
//! Handles:
//! - request dispatch ([`handle_line`])
//! - PID file management
//! - client side: [`request`], [`ping`], [`status`], [`stop`]

use crate::config::Paths;
use crate::enforcer::Enforcer;
use crate::hook::HookOutcome;
use crate::state::store::write_atomic;
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub mod server;

pub use server::DaemonServer;

/// Largest request line the daemon reads
pub const MAX_REQUEST_BYTES: u64 = 4 * 1024 * 1024;

/// Per-connection read deadline on the server side
pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: u32 },
    /// PID file points at a live process that does not answer pings
    Unresponsive { pid: u32 },
    Stopped,
}

fn invalid_json() -> Value {
    json!({"exit_code": 2, "stderr": "[DAEMON] Invalid JSON\n", "stdout": ""})
}

fn outcome_json(outcome: &HookOutcome) -> Value {
    json!({
        "exit_code": outcome.exit_code,
        "stderr": outcome.stderr,
        "stdout": outcome.stdout,
    })
}

/// Answer one request line. The enforcer runs with a fresh cache and
/// Q-table so each request behaves like a separate hook process.
pub fn handle_line(enforcer: &Mutex<Enforcer>, line: &str) -> Value {
    let line = line.trim();
    let parsed: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "daemon got invalid JSON");
            return invalid_json();
        }
    };
    if parsed.get("method").and_then(Value::as_str) == Some("ping") {
        return json!({"exit_code": 0, "stderr": "", "stdout": "", "ping": "pong"});
    }

    // A poisoned lock only means an earlier request panicked mid-dispatch;
    // every request resets the enforcer anyway
    let mut enforcer = enforcer.lock().unwrap_or_else(|p| p.into_inner());
    enforcer.reset_for_request();
    outcome_json(&enforcer.handle_raw(line))
}

/// Crash response for a request whose dispatch died
pub fn crash_response(error: &str) -> Value {
    json!({
        "exit_code": 2,
        "stderr": format!("[DAEMON] Enforcer crash: {}\n", error),
        "stdout": "",
    })
}

pub fn write_pid_file(paths: &Paths, pid: u32) -> Result<()> {
    write_atomic(&paths.enforcer_pid(), pid.to_string().as_bytes())
        .context("Failed to write daemon PID file")
}

pub fn read_pid(paths: &Paths) -> Option<u32> {
    std::fs::read_to_string(paths.enforcer_pid())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Remove the socket and PID file. Missing files are fine.
pub fn remove_runtime_files(paths: &Paths) {
    for path in [paths.enforcer_socket(), paths.enforcer_pid()] {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "remove failed"),
        }
    }
}

pub fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence and permission
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    // SAFETY: plain kill(2) on a pid read from our own PID file
    if unsafe { libc::kill(pid as libc::pid_t, signal) } != 0 {
        bail!(
            "Failed to send signal {} to process {}: {}",
            signal,
            pid,
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Re-encode a hook payload as one compact JSON line. Payloads that do not
/// parse are refused so the caller can enforce inline instead.
pub fn compact_line(payload: &str) -> Result<String> {
    let value: Value =
        serde_json::from_str(payload).context("Hook payload is not valid JSON")?;
    Ok(serde_json::to_string(&value)?)
}

/// Send one request line and read one response line
pub fn round_trip(socket: &Path, payload: &str, timeout: Duration) -> Result<Value> {
    let mut line = compact_line(payload)?;
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    line.push('\n');
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream.take(MAX_REQUEST_BYTES));
    let mut response = String::new();
    let n = reader.read_line(&mut response)?;
    if n == 0 {
        bail!("Daemon closed the connection without a response");
    }
    serde_json::from_str(response.trim()).context("Daemon returned invalid JSON")
}

/// Forward a hook payload to the daemon
pub fn request(paths: &Paths, raw: &str, timeout: Duration) -> Result<HookOutcome> {
    let response = round_trip(&paths.enforcer_socket(), raw, timeout)?;
    serde_json::from_value(response).context("Daemon response is not a hook outcome")
}

pub fn ping(paths: &Paths, timeout: Duration) -> bool {
    match round_trip(&paths.enforcer_socket(), r#"{"method":"ping"}"#, timeout) {
        Ok(resp) => resp.get("ping").and_then(Value::as_str) == Some("pong"),
        Err(e) => {
            tracing::debug!(error = %e, "daemon ping failed");
            false
        }
    }
}

pub fn status(paths: &Paths) -> DaemonStatus {
    let Some(pid) = read_pid(paths) else {
        return DaemonStatus::Stopped;
    };
    if !process_exists(pid) {
        return DaemonStatus::Stopped;
    }
    if ping(paths, Duration::from_millis(500)) {
        DaemonStatus::Running { pid }
    } else {
        DaemonStatus::Unresponsive { pid }
    }
}

/// SIGTERM the daemon and wait for it to exit. Returns false when nothing
/// was running; stale runtime files are removed either way.
pub fn stop(paths: &Paths, timeout: Duration) -> Result<bool> {
    let Some(pid) = read_pid(paths) else {
        remove_runtime_files(paths);
        return Ok(false);
    };
    if !process_exists(pid) {
        tracing::info!(pid, "stale daemon PID file");
        remove_runtime_files(paths);
        return Ok(false);
    }

    tracing::info!(pid, "sending SIGTERM to daemon");
    send_signal(pid, libc::SIGTERM)?;
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < timeout {
        if !process_exists(pid) {
            remove_runtime_files(paths);
            return Ok(true);
        }
        std::thread::sleep(step);
        waited += step;
    }
    bail!("Daemon (PID {}) did not stop within {:?}", pid, timeout)
}
