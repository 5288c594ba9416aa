//! Diagnostic logging setup.
//!
//! Hook invocations own stdout/stderr (they are the hook protocol), so hooks
//! log to a file under the hooks dir. Admin commands and a foreground daemon
//! log to stderr.

use crate::audit::rotate_numbered;
use crate::config::{LogFormat, LoggingConfig, Paths};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LEVEL: &str = "warn";
const MAX_ROTATED_LOGS: u32 = 3;

/// Where log lines go
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

impl LogTarget {
    /// The configured log file, or `torus.log` in the hooks dir
    pub fn hook_file(config: &LoggingConfig, paths: &Paths) -> Self {
        let path = config
            .file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.log_file());
        Self::File(path)
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(config: &LoggingConfig, target: LogTarget) -> Result<()> {
    let level = config.level.as_deref().unwrap_or(DEFAULT_LEVEL);
    let filter = EnvFilter::try_from_env("TORUS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let ansi = matches!(target, LogTarget::Stderr);
    let writer = match target {
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogTarget::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let oversized = std::fs::metadata(&path)
                .map(|m| m.len() > config.max_file_bytes())
                .unwrap_or(false);
            if oversized {
                rotate_numbered(&path, MAX_ROTATED_LOGS);
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let installed = match config.format {
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(layer.compact())
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init(),
    };
    // Already installed (tests, daemon re-entry): keep the existing one
    if let Err(e) = installed {
        tracing::debug!(error = %e, "log subscriber already installed");
    }
    Ok(())
}

/// Best-effort init for hook binaries; logging must never fail a hook
pub fn init_for_hook(config: &LoggingConfig, paths: &Paths) {
    let _ = init(config, LogTarget::hook_file(config, paths));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hook_file_target_defaults_to_hooks_dir() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        let config = LoggingConfig::default();
        match LogTarget::hook_file(&config, &paths) {
            LogTarget::File(path) => assert_eq!(path, paths.log_file()),
            LogTarget::Stderr => panic!("expected a file target"),
        }
    }

    #[test]
    fn test_init_creates_log_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("torus.log");
        let config = LoggingConfig {
            level: Some("debug".to_string()),
            format: LogFormat::Json,
            file: None,
            max_file_bytes: None,
        };
        init(&config, LogTarget::File(path.clone())).unwrap();
        assert!(path.exists());
        // Second init must not error
        init(&config, LogTarget::Stderr).unwrap();
    }

    #[test]
    fn test_oversized_log_is_rotated_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("torus.log");
        std::fs::write(&path, vec![b'x'; 64]).unwrap();
        std::fs::write(dir.path().join("torus.log.1"), "older").unwrap();
        let config = LoggingConfig {
            max_file_bytes: Some(32),
            ..LoggingConfig::default()
        };
        init(&config, LogTarget::File(path.clone())).unwrap();

        assert_eq!(std::fs::read(dir.path().join("torus.log.1")).unwrap().len(), 64);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("torus.log.2")).unwrap(),
            "older"
        );
        assert!(std::fs::metadata(&path).unwrap().len() < 64);
    }

    #[test]
    fn test_max_file_bytes_defaults_to_audit_cap() {
        assert_eq!(LoggingConfig::default().max_file_bytes(), 5 * 1024 * 1024);
    }
}
