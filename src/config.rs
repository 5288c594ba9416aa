use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Output format for diagnostic logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "compact" | "text" | "pretty" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Json => "json",
        }
    }
}

/// Where hook state and the host's own files live
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PathsConfig {
    #[serde(default)]
    pub hooks_dir: Option<String>,
    #[serde(default)]
    pub claude_dir: Option<String>,
}

/// Gate result cache settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Enforcer daemon settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// How long the shim waits for the daemon before running inline
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
}

fn default_client_timeout_ms() -> u64 {
    4_000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            client_timeout_ms: default_client_timeout_ms(),
        }
    }
}

/// Memory worker socket settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_memory_timeout_ms() -> u64 {
    2_000
}

fn default_max_response_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_memory_timeout_ms(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

/// Audit trail retention and rotation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_audit_max_rotated")]
    pub max_rotated: u32,
    #[serde(default = "default_audit_retention_days")]
    pub retention_days: u64,
}

fn default_audit_max_file_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_audit_max_rotated() -> u32 {
    10
}
fn default_audit_retention_days() -> u64 {
    90
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_audit_max_file_bytes(),
            max_rotated: default_audit_max_rotated(),
            retention_days: default_audit_retention_days(),
        }
    }
}

/// Diagnostic logging settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: LogFormat,
    /// Log file for hook invocations (stderr belongs to the hook protocol)
    #[serde(default)]
    pub file: Option<String>,
    /// Rotate the log file past this size; defaults to the audit file cap
    #[serde(default)]
    pub max_file_bytes: Option<u64>,
}

impl LoggingConfig {
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
            .unwrap_or_else(default_audit_max_file_bytes)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.torus/config.local.toml) > project (.torus/config.toml) > user (~/.torus/config.toml)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".torus").join("config.toml");
            if user_config.exists() {
                let user = Self::load_from(&user_config)?;
                config.merge(user);
            }
        }

        let project_config = Path::new(".torus").join("config.toml");
        if project_config.exists() {
            let project = Self::load_from(&project_config)?;
            config.merge(project);
        }

        // Gitignored overrides
        let local_config = Path::new(".torus").join("config.local.toml");
        if local_config.exists() {
            let local = Self::load_from(&local_config)?;
            config.merge(local);
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Merge another config into this one (other takes priority)
    /// Optional paths and log settings only override when set; numeric sections are replaced.
    pub fn merge(&mut self, other: Config) {
        if other.paths.hooks_dir.is_some() {
            self.paths.hooks_dir = other.paths.hooks_dir;
        }
        if other.paths.claude_dir.is_some() {
            self.paths.claude_dir = other.paths.claude_dir;
        }

        self.cache = other.cache;
        self.daemon = other.daemon;
        self.memory = other.memory;
        self.audit = other.audit;

        if other.logging.level.is_some() {
            self.logging.level = other.logging.level;
        }
        if other.logging.format != LogFormat::Compact {
            self.logging.format = other.logging.format;
        }
        if other.logging.max_file_bytes.is_some() {
            self.logging.max_file_bytes = other.logging.max_file_bytes;
        }
        if other.logging.file.is_some() {
            self.logging.file = other.logging.file;
        }
    }

    /// Resolve directories: config values, then TORUS_* environment, then ~/.claude defaults
    pub fn paths(&self) -> Paths {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let claude_dir = std::env::var("TORUS_CLAUDE_DIR")
            .ok()
            .or_else(|| self.paths.claude_dir.clone())
            .map(|p| expand_tilde(&p, &home))
            .unwrap_or_else(|| home.join(".claude"));
        let hooks_dir = std::env::var("TORUS_HOOKS_DIR")
            .ok()
            .or_else(|| self.paths.hooks_dir.clone())
            .map(|p| expand_tilde(&p, &home))
            .unwrap_or_else(|| claude_dir.join("hooks"));
        Paths::new(hooks_dir, claude_dir)
    }
}

fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None if path == "~" => home.to_path_buf(),
        None => PathBuf::from(path),
    }
}

/// Every on-disk location the hooks touch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub hooks_dir: PathBuf,
    pub claude_dir: PathBuf,
}

impl Paths {
    pub fn new(hooks_dir: impl Into<PathBuf>, claude_dir: impl Into<PathBuf>) -> Self {
        Self {
            hooks_dir: hooks_dir.into(),
            claude_dir: claude_dir.into(),
        }
    }

    /// Lay out a hooks dir at `<root>/hooks` with `root` as the host dir
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("hooks"), root.to_path_buf())
    }

    pub fn state_file(&self, session_id: &str) -> PathBuf {
        self.hooks_dir
            .join(format!("state_{}.json", sanitize_session_id(session_id)))
    }

    pub fn legacy_state_file(&self) -> PathBuf {
        self.hooks_dir.join("state.json")
    }

    pub fn memory_sideband(&self) -> PathBuf {
        self.hooks_dir.join(".memory_last_queried")
    }

    pub fn enforcer_sideband(&self, session_id: &str) -> PathBuf {
        self.hooks_dir.join(format!(
            ".enforcer_sideband_{}.json",
            sanitize_session_id(session_id)
        ))
    }

    pub fn effectiveness_file(&self) -> PathBuf {
        self.hooks_dir.join(".gate_effectiveness.json")
    }

    pub fn qtable_file(&self) -> PathBuf {
        self.hooks_dir.join(".gate_qtable.json")
    }

    pub fn gate_breaker_file(&self) -> PathBuf {
        self.hooks_dir.join(".circuit_breaker_state.json")
    }

    pub fn service_breaker_file(&self) -> PathBuf {
        self.hooks_dir.join(".circuit_breaker.json")
    }

    pub fn claims_file(&self) -> PathBuf {
        self.hooks_dir.join(".file_claims.json")
    }

    pub fn enforcer_socket(&self) -> PathBuf {
        self.hooks_dir.join(".enforcer.sock")
    }

    pub fn enforcer_pid(&self) -> PathBuf {
        self.hooks_dir.join(".enforcer.pid")
    }

    pub fn memory_socket(&self) -> PathBuf {
        self.hooks_dir.join(".memory.sock")
    }

    pub fn capture_queue(&self) -> PathBuf {
        self.hooks_dir.join(".capture_queue.jsonl")
    }

    pub fn auto_remember_queue(&self) -> PathBuf {
        self.hooks_dir.join(".auto_remember_queue.jsonl")
    }

    pub fn canary_log(&self) -> PathBuf {
        self.hooks_dir.join(".gate_canary.jsonl")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.hooks_dir.join("audit")
    }

    pub fn audit_trail(&self) -> PathBuf {
        self.hooks_dir.join(".audit_trail.jsonl")
    }

    pub fn log_file(&self) -> PathBuf {
        self.hooks_dir.join("torus.log")
    }

    pub fn metrics_file(&self) -> PathBuf {
        self.hooks_dir.join("metrics.json")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.claude_dir.join("skills")
    }

    pub fn prps_dir(&self) -> PathBuf {
        self.claude_dir.join("PRPs")
    }

    pub fn toggles_file(&self) -> PathBuf {
        self.claude_dir.join("config.json")
    }

    pub fn live_state_file(&self) -> PathBuf {
        self.claude_dir.join("LIVE_STATE.json")
    }
}

/// Keep only characters that are safe in a file name; empty ids map to "main"
pub fn sanitize_session_id(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if safe.is_empty() {
        "main".to_string()
    } else {
        safe
    }
}

/// Live feature toggles: `config.json` first, `LIVE_STATE.json` as the fallback per key
#[derive(Debug, Clone, Default)]
pub struct Toggles {
    config: Map<String, Value>,
    live_state: Map<String, Value>,
}

impl Toggles {
    /// Read both toggle files once; unreadable files count as empty
    pub fn load(paths: &Paths) -> Self {
        Self {
            config: read_json_object(&paths.toggles_file()),
            live_state: read_json_object(&paths.live_state_file()),
        }
    }

    pub fn from_values(config: Value, live_state: Value) -> Self {
        Self {
            config: config.as_object().cloned().unwrap_or_default(),
            live_state: live_state.as_object().cloned().unwrap_or_default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.config.get(key).or_else(|| self.live_state.get(key))
    }

    /// Truthiness in the JSON sense: false, null, 0 and "" are off
    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn read_json_object(path: &Path) -> Map<String, Value> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_session_id() {
        assert_eq!(sanitize_session_id("abc-123_x"), "abc-123_x");
        assert_eq!(sanitize_session_id("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_session_id(""), "main");
        assert_eq!(sanitize_session_id("///"), "main");
    }

    #[test]
    fn test_paths_layout() {
        let paths = Paths::under(Path::new("/tmp/x"));
        assert_eq!(paths.hooks_dir, PathBuf::from("/tmp/x/hooks"));
        assert_eq!(
            paths.state_file("s1"),
            PathBuf::from("/tmp/x/hooks/state_s1.json")
        );
        assert_eq!(paths.skills_dir(), PathBuf::from("/tmp/x/skills"));
        assert_eq!(
            paths.enforcer_sideband("a/b"),
            PathBuf::from("/tmp/x/hooks/.enforcer_sideband_ab.json")
        );
    }

    #[test]
    fn test_parse_and_merge() {
        let base: Config = toml::from_str("").unwrap();
        assert!(base.cache.enabled);
        assert_eq!(base.cache.ttl_secs, 60);
        assert_eq!(base.daemon.client_timeout_ms, 4_000);

        let mut config = Config::default();
        let other: Config = toml::from_str(
            r#"
            [paths]
            hooks_dir = "/var/torus"

            [cache]
            enabled = false

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        config.merge(other);
        assert_eq!(config.paths.hooks_dir.as_deref(), Some("/var/torus"));
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[audit]\nretention_days = 7\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.audit.retention_days, 7);
        assert_eq!(config.audit.max_rotated, 10);
    }

    #[test]
    fn test_toggles_fallback() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        std::fs::write(
            paths.toggles_file(),
            json!({"security_profile": "strict"}).to_string(),
        )
        .unwrap();
        std::fs::write(
            paths.live_state_file(),
            json!({"security_profile": "permissive", "mentor_all": true}).to_string(),
        )
        .unwrap();

        let toggles = Toggles::load(&paths);
        assert_eq!(toggles.string("security_profile").as_deref(), Some("strict"));
        assert!(toggles.flag("mentor_all"));
        assert!(!toggles.flag("budget_degradation"));
    }

    #[test]
    fn test_toggle_number_parsing() {
        let toggles = Toggles::from_values(
            json!({"session_token_budget": "5000"}),
            json!({"other": 3}),
        );
        assert_eq!(toggles.number("session_token_budget"), Some(5000.0));
        assert_eq!(toggles.number("other"), Some(3.0));
        assert_eq!(toggles.number("missing"), None);
    }
}
