//! JSONL audit trail of gate decisions.
//!
//! Each decision is appended to `audit/YYYY-MM-DD.jsonl` (rotated by size) and
//! to the long-lived `.audit_trail.jsonl`. Writing never fails the caller.

use crate::config::{AuditConfig, Paths};
use crate::gate_result::Severity;
use crate::gates::GateId;
use crate::state::store::write_json_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const ULID_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// 26-char lexicographically sortable id: 48-bit ms timestamp plus 80 random bits
pub fn ulid(now: DateTime<Utc>) -> String {
    let ts = now.timestamp_millis().max(0) as u128 & ((1u128 << 48) - 1);
    let mut random = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut random);
    let rand_bits = random.iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b));
    let value = (ts << 80) | rand_bits;
    (0..26)
        .rev()
        .map(|i| ULID_ALPHABET[((value >> (i * 5)) & 0x1f) as usize] as char)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pass,
    Block,
    Warn,
    Ask,
    Slow,
    Crash,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Block => "block",
            Self::Warn => "warn",
            Self::Ask => "ask",
            Self::Slow => "slow",
            Self::Crash => "crash",
        }
    }
}

/// One audit line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub gate: String,
    #[serde(default)]
    pub tool: String,
    pub decision: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub state_keys: Vec<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
}

impl AuditEntry {
    pub fn new(gate: &str, tool: &str, decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            timestamp: String::new(),
            gate: gate.to_string(),
            tool: tool.to_string(),
            decision: decision.as_str().to_string(),
            reason: reason.into(),
            session_id: String::new(),
            state_keys: Vec::new(),
            severity: Severity::Info.as_str().to_string(),
            file_path: String::new(),
            agent_id: String::new(),
        }
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = session_id.to_string();
        self
    }

    pub fn state_keys(mut self, keys: &[&str]) -> Self {
        self.state_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity.as_str().to_string();
        self
    }

    pub fn file_path(mut self, file_path: &str) -> Self {
        self.file_path = file_path.to_string();
        self
    }

    fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Older entries used dotted module names; report them by label
fn normalize_gate_name(raw: &str) -> String {
    if raw.starts_with("gates.") {
        if let Some(id) = GateId::from_name(raw) {
            return id.label().to_string();
        }
    }
    raw.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeverityDist {
    pub info: u64,
    pub warn: u64,
    pub error: u64,
    pub critical: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateDayCounts {
    pub pass: u64,
    pub block: u64,
    pub warn: u64,
    pub severity_dist: SeverityDist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySummary {
    pub date: String,
    pub gates: BTreeMap<String, GateDayCounts>,
    pub total_events: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BlockSummary {
    /// Highest count first
    pub blocked_by_gate: Vec<(String, u64)>,
    pub blocked_by_tool: Vec<(String, u64)>,
    pub total_blocks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateActivity {
    pub pass_count: u64,
    pub block_count: u64,
    pub warn_count: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub deleted: u64,
    pub errors: u64,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    dir: PathBuf,
    trail: PathBuf,
    config: AuditConfig,
}

impl AuditLog {
    pub fn new(paths: &Paths, config: &AuditConfig) -> Self {
        Self {
            dir: paths.audit_dir(),
            trail: paths.audit_trail(),
            config: config.clone(),
        }
    }

    pub fn record(&self, entry: AuditEntry) {
        self.record_at(entry, Utc::now());
    }

    /// Append with an explicit clock. Errors are logged and swallowed.
    pub fn record_at(&self, mut entry: AuditEntry, now: DateTime<Utc>) {
        entry.id = ulid(now);
        entry.timestamp = now.to_rfc3339_opts(SecondsFormat::Micros, false);
        if entry.agent_id.is_empty() {
            entry.agent_id = entry.session_id.clone();
        }
        if let Err(e) = self.append(&entry, now) {
            tracing::warn!(error = %e, gate = %entry.gate, "audit write failed");
        }
    }

    fn append(&self, entry: &AuditEntry, now: DateTime<Utc>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let daily = self.dir.join(format!("{}.jsonl", now.format("%Y-%m-%d")));
        if fs::metadata(&daily)
            .map(|m| m.len() > self.config.max_file_bytes)
            .unwrap_or(false)
        {
            rotate_numbered(&daily, self.config.max_rotated);
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        append_line(&daily, &line)?;
        if let Err(e) = append_line(&self.trail, &line) {
            tracing::debug!(error = %e, "audit trail append failed");
        }
        Ok(())
    }

    /// Newest first from the trail, optionally for a single gate label
    pub fn recent_decisions(&self, gate: Option<&str>, limit: usize) -> Vec<AuditEntry> {
        let Ok(content) = fs::read_to_string(&self.trail) else {
            return Vec::new();
        };
        content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line.trim()).ok())
            .map(|mut entry| {
                entry.gate = normalize_gate_name(&entry.gate);
                entry
            })
            .filter(|entry| gate.map(|g| entry.gate == g).unwrap_or(true))
            .take(limit)
            .collect()
    }

    fn audit_files(&self) -> Vec<PathBuf> {
        let Ok(dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = dir
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_audit_file(p))
            .collect();
        files.sort();
        files
    }

    fn daily_entries(&self) -> impl Iterator<Item = AuditEntry> {
        self.audit_files()
            .into_iter()
            .filter(|p| p.extension().map(|e| e == "jsonl").unwrap_or(false))
            .flat_map(|p| read_entries(&p))
    }

    /// Aggregate every audit file into `audit/summary.json`
    pub fn compact(&self) -> Result<Vec<DaySummary>> {
        let mut days: BTreeMap<String, BTreeMap<String, GateDayCounts>> = BTreeMap::new();
        for path in self.audit_files() {
            for entry in read_entries(&path) {
                let date = if entry.timestamp.len() >= 10 {
                    entry.timestamp[..10].to_string()
                } else {
                    "unknown".to_string()
                };
                let counts = days
                    .entry(date)
                    .or_default()
                    .entry(normalize_gate_name(&entry.gate))
                    .or_default();
                match entry.decision.as_str() {
                    "pass" => counts.pass += 1,
                    "block" => counts.block += 1,
                    "warn" => counts.warn += 1,
                    _ => {}
                }
                match entry.severity.as_str() {
                    "warn" => counts.severity_dist.warn += 1,
                    "error" => counts.severity_dist.error += 1,
                    "critical" => counts.severity_dist.critical += 1,
                    _ => counts.severity_dist.info += 1,
                }
            }
        }

        let summary: Vec<DaySummary> = days
            .into_iter()
            .map(|(date, gates)| {
                let total_events = gates.values().map(|c| c.pass + c.block + c.warn).sum();
                DaySummary {
                    date,
                    gates,
                    total_events,
                }
            })
            .collect();
        fs::create_dir_all(&self.dir)?;
        write_json_atomic(&self.dir.join("summary.json"), &summary)?;
        Ok(summary)
    }

    /// Delete audit files not modified within `max_age_days`
    pub fn cleanup_old_files(&self, max_age_days: u64) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(max_age_days * 86_400))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        for path in self.audit_files() {
            let stale = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|mtime| mtime < cutoff);
            match stale {
                Ok(true) => match fs::remove_file(&path) {
                    Ok(()) => report.deleted += 1,
                    Err(_) => report.errors += 1,
                },
                Ok(false) => {}
                Err(_) => report.errors += 1,
            }
        }
        report
    }

    /// Blocks within the last `hours`, grouped by gate and tool
    pub fn block_summary(&self, hours: i64, now: DateTime<Utc>) -> BlockSummary {
        let cutoff = now - Duration::hours(hours);
        let mut by_gate: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_tool: BTreeMap<String, u64> = BTreeMap::new();
        let mut total = 0;
        for entry in self.daily_entries() {
            if entry.decision != "block" {
                continue;
            }
            match entry.parsed_timestamp() {
                Some(ts) if ts >= cutoff => {}
                _ => continue,
            }
            *by_gate.entry(normalize_gate_name(&entry.gate)).or_default() += 1;
            *by_tool.entry(entry.tool.clone()).or_default() += 1;
            total += 1;
        }
        BlockSummary {
            blocked_by_gate: sorted_desc(by_gate),
            blocked_by_tool: sorted_desc(by_tool),
            total_blocks: total,
        }
    }

    /// Decision counts for one gate label over the last `minutes`
    pub fn gate_activity(&self, gate: &str, minutes: i64, now: DateTime<Utc>) -> GateActivity {
        let cutoff = now - Duration::minutes(minutes);
        let mut activity = GateActivity::default();
        for entry in self.daily_entries() {
            if entry.gate != gate {
                continue;
            }
            match entry.parsed_timestamp() {
                Some(ts) if ts >= cutoff => {}
                _ => continue,
            }
            match entry.decision.as_str() {
                "pass" => activity.pass_count += 1,
                "block" => activity.block_count += 1,
                "warn" => activity.warn_count += 1,
                _ => continue,
            }
            activity.total += 1;
        }
        activity
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// current → .1, .1 → .2, ...; anything past `max_rotated` is deleted
pub(crate) fn rotate_numbered(path: &Path, max_rotated: u32) {
    let numbered = |i: u32| PathBuf::from(format!("{}.{}", path.display(), i));
    let _ = fs::remove_file(numbered(max_rotated));
    for i in (1..max_rotated).rev() {
        let from = numbered(i);
        if from.exists() {
            let _ = fs::rename(&from, numbered(i + 1));
        }
    }
    if let Err(e) = fs::rename(path, numbered(1)) {
        tracing::warn!(error = %e, path = %path.display(), "log rotation failed");
    }
}

/// `*.jsonl` and rotated `*.jsonl.N`; never `summary.json` or temp files
fn is_audit_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.contains(".tmp") {
        return false;
    }
    name.ends_with(".jsonl") || name.contains(".jsonl.")
}

fn read_entries(path: &Path) -> Vec<AuditEntry> {
    let Ok(file) = fs::File::open(path) else {
        return Vec::new();
    };
    BufReader::new(file)
        .lines()
        .map_while(|l| l.ok())
        .filter_map(|line| serde_json::from_str(line.trim()).ok())
        .collect()
}

fn sorted_desc(counts: BTreeMap<String, u64>) -> Vec<(String, u64)> {
    let mut v: Vec<(String, u64)> = counts.into_iter().collect();
    v.sort_by(|a, b| b.1.cmp(&a.1));
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn audit(dir: &TempDir, config: AuditConfig) -> AuditLog {
        let paths = Paths::under(dir.path());
        fs::create_dir_all(&paths.hooks_dir).unwrap();
        AuditLog::new(&paths, &config)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn test_ulid_shape_and_order() {
        let a = ulid(at(10, 0));
        let b = ulid(at(10, 1));
        assert_eq!(a.len(), 26);
        assert!(a.chars().all(|c| ULID_ALPHABET.contains(&(c as u8))));
        assert!(a[..10] < b[..10]);
    }

    #[test]
    fn test_record_writes_daily_and_trail() {
        let dir = TempDir::new().unwrap();
        let log = audit(&dir, AuditConfig::default());
        log.record_at(
            AuditEntry::new("GATE 1: READ BEFORE EDIT", "Edit", Decision::Block, "read it")
                .session("s1")
                .state_keys(&["files_read"])
                .severity(Severity::Error),
            at(9, 0),
        );
        log.record_at(
            AuditEntry::new("GATE 2: NO DESTROY", "Bash", Decision::Pass, ""),
            at(9, 1),
        );

        let daily = dir.path().join("hooks/audit/2026-03-14.jsonl");
        assert_eq!(fs::read_to_string(daily).unwrap().lines().count(), 2);

        let recent = log.recent_decisions(None, 50);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].gate, "GATE 2: NO DESTROY");
        assert_eq!(recent[1].agent_id, "s1");
        assert_eq!(recent[1].state_keys, vec!["files_read"]);

        let only = log.recent_decisions(Some("GATE 1: READ BEFORE EDIT"), 50);
        assert_eq!(only.len(), 1);
        assert_eq!(log.recent_decisions(None, 1).len(), 1);
    }

    #[test]
    fn test_rotation_numbers_files() {
        let dir = TempDir::new().unwrap();
        let log = audit(
            &dir,
            AuditConfig {
                max_file_bytes: 10,
                max_rotated: 2,
                retention_days: 90,
            },
        );
        for i in 0..4 {
            log.record_at(
                AuditEntry::new("g", "Bash", Decision::Pass, format!("n{}", i)),
                at(9, i),
            );
        }
        let base = dir.path().join("hooks/audit/2026-03-14.jsonl");
        assert!(base.exists());
        assert!(PathBuf::from(format!("{}.1", base.display())).exists());
        assert!(!PathBuf::from(format!("{}.3", base.display())).exists());
    }

    #[test]
    fn test_compact_and_block_summary() {
        let dir = TempDir::new().unwrap();
        let log = audit(&dir, AuditConfig::default());
        log.record_at(AuditEntry::new("gates.gate_02_no_destroy", "Bash", Decision::Block, "x"), at(8, 0));
        log.record_at(AuditEntry::new("GATE 2: NO DESTROY", "Bash", Decision::Block, "y"), at(11, 0));
        log.record_at(AuditEntry::new("GATE 5: PROOF BEFORE FIXED", "Edit", Decision::Warn, "z"), at(11, 5));

        let summary = log.compact().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].gates["GATE 2: NO DESTROY"].block, 2);
        assert_eq!(summary[0].total_events, 3);
        assert!(dir.path().join("hooks/audit/summary.json").exists());

        let blocks = log.block_summary(2, at(12, 0));
        assert_eq!(blocks.total_blocks, 1);
        assert_eq!(blocks.blocked_by_tool, vec![("Bash".to_string(), 1)]);

        let activity = log.gate_activity("GATE 5: PROOF BEFORE FIXED", 30, at(11, 20));
        assert_eq!(activity.warn_count, 1);
        assert_eq!(activity.total, 1);
    }

    #[test]
    fn test_cleanup_keeps_fresh_files() {
        let dir = TempDir::new().unwrap();
        let log = audit(&dir, AuditConfig::default());
        log.record_at(AuditEntry::new("g", "Bash", Decision::Pass, ""), at(9, 0));
        log.compact().unwrap();
        let report = log.cleanup_old_files(90);
        assert_eq!(report.deleted, 0);
        // Everything is older than "0 days ago" except summary.json, which is never touched
        let report = log.cleanup_old_files(0);
        assert_eq!(report.deleted, 1);
        assert!(dir.path().join("hooks/audit/summary.json").exists());
    }
}
