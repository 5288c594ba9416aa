//! Unix socket server: one tokio task per connection, dispatch serialized
//! behind the enforcer mutex.

use super::{crash_response, handle_line, remove_runtime_files, write_pid_file};
use super::{CLIENT_READ_TIMEOUT, MAX_REQUEST_BYTES};
use crate::config::{Config, Paths};
use crate::enforcer::Enforcer;
use crate::events::{self, Event};
use anyhow::{Context, Result};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;

/// How often the accept loop checks that its socket file still exists
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

pub struct DaemonServer {
    paths: Paths,
    enforcer: Arc<Mutex<Enforcer>>,
    requests: Arc<AtomicU64>,
}

/// Removes socket and PID file however the server exits
struct RuntimeFilesGuard(Paths);

impl Drop for RuntimeFilesGuard {
    fn drop(&mut self) {
        remove_runtime_files(&self.0);
    }
}

fn bind(socket: &Path) -> Result<UnixListener> {
    if socket.exists() {
        std::fs::remove_file(socket)
            .with_context(|| format!("Failed to remove stale socket {}", socket.display()))?;
    }
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    UnixListener::bind(socket).with_context(|| format!("Failed to bind {}", socket.display()))
}

impl DaemonServer {
    pub fn new(config: &Config) -> Self {
        Self::with_paths(config, config.paths())
    }

    pub fn with_paths(config: &Config, paths: Paths) -> Self {
        Self {
            enforcer: Arc::new(Mutex::new(Enforcer::with_paths(config, paths.clone()))),
            paths,
            requests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn requests_served(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Serve until SIGTERM or Ctrl+C
    pub async fn run(self) -> Result<()> {
        self.serve(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let socket = self.paths.enforcer_socket();
        let mut listener = bind(&socket)?;
        let pid = std::process::id();
        write_pid_file(&self.paths, pid)?;
        let _guard = RuntimeFilesGuard(self.paths.clone());

        tracing::info!(pid, socket = %socket.display(), "enforcer daemon started");
        events::emit(Event::daemon_started(pid, &socket.to_string_lossy()));

        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let enforcer = Arc::clone(&self.enforcer);
                        let requests = Arc::clone(&self.requests);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, enforcer, requests).await {
                                tracing::debug!(error = %e, "connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        // EMFILE and friends: back off, then start over on a fresh socket
                        tracing::warn!(error = %e, "accept failed, rebinding");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        match bind(&socket) {
                            Ok(l) => listener = l,
                            Err(e) => {
                                tracing::error!(error = %e, "rebind failed, retrying in 5s");
                                tokio::time::sleep(Duration::from_secs(5)).await;
                            }
                        }
                    }
                },
                _ = watchdog.tick() => {
                    if !socket.exists() {
                        tracing::warn!("socket file missing, rebinding");
                        listener = bind(&socket)?;
                    }
                }
            }
        }

        let served = self.requests_served();
        tracing::info!(requests = served, "enforcer daemon stopped");
        events::emit(Event::daemon_stopped(served));
        Ok(())
    }
}

async fn handle_connection(
    stream: UnixStream,
    enforcer: Arc<Mutex<Enforcer>>,
    requests: Arc<AtomicU64>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_REQUEST_BYTES));
    let mut line = String::new();

    let n = tokio::time::timeout(CLIENT_READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .context("Timed out waiting for request")??;
    if n == 0 {
        return Ok(());
    }

    let started = Instant::now();
    let response = tokio::task::spawn_blocking(move || handle_line(&enforcer, &line))
        .await
        .unwrap_or_else(|e| crash_response(&e.to_string()));

    let exit_code = response
        .get("exit_code")
        .and_then(Value::as_i64)
        .unwrap_or(0) as i32;
    requests.fetch_add(1, Ordering::Relaxed);
    events::emit(Event::daemon_request(
        exit_code,
        started.elapsed().as_secs_f64() * 1000.0,
    ));

    let mut out = serde_json::to_string(&response)?;
    out.push('\n');
    write_half.write_all(out.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    async fn wait_for_socket(paths: &Paths) {
        for _ in 0..100 {
            if paths.enforcer_socket().exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("daemon socket never appeared");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serves_requests_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        std::fs::create_dir_all(&paths.hooks_dir).unwrap();

        let server = DaemonServer::with_paths(&Config::default(), paths.clone());
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(async {
            let _ = rx.await;
        }));
        wait_for_socket(&paths).await;
        assert_eq!(super::super::read_pid(&paths), Some(std::process::id()));

        let client_paths = paths.clone();
        let (pong, outcome) = tokio::task::spawn_blocking(move || {
            let pong = super::super::ping(&client_paths, Duration::from_secs(2));
            let outcome = super::super::request(
                &client_paths,
                r#"{"tool_name": "Glob", "tool_input": {"pattern": "*.rs"}}"#,
                Duration::from_secs(2),
            )
            .unwrap();
            (pong, outcome)
        })
        .await
        .unwrap();
        assert!(pong);
        assert_eq!(outcome.exit_code, 0);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!paths.enforcer_socket().exists());
        assert!(!paths.enforcer_pid().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_line_request_matches_inline() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        std::fs::create_dir_all(&paths.hooks_dir).unwrap();
        let pretty = serde_json::to_string_pretty(&serde_json::json!({
            "tool_name": "Glob",
            "tool_input": {"pattern": "*.rs"}
        }))
        .unwrap();
        assert!(pretty.contains('\n'));

        let inline = Enforcer::with_paths(&Config::default(), paths.clone()).handle_raw(&pretty);

        let server = DaemonServer::with_paths(&Config::default(), paths.clone());
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(async {
            let _ = rx.await;
        }));
        wait_for_socket(&paths).await;

        let client_paths = paths.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            super::super::request(&client_paths, &pretty, Duration::from_secs(2)).unwrap()
        })
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, inline.exit_code);
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.stderr.contains("Invalid JSON"));

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rebinds_when_socket_deleted() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        std::fs::create_dir_all(&paths.hooks_dir).unwrap();

        let server = DaemonServer::with_paths(&Config::default(), paths.clone());
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve(async {
            let _ = rx.await;
        }));
        wait_for_socket(&paths).await;

        std::fs::remove_file(paths.enforcer_socket()).unwrap();
        tokio::time::sleep(WATCHDOG_INTERVAL + Duration::from_millis(500)).await;
        assert!(paths.enforcer_socket().exists());

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
