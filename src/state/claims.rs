//! Cross-session file claims for workspace isolation.

use super::store::{lock_path_for, write_json_atomic, FileLock};
use crate::config::Paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

/// Claims older than this are ignored and dropped on the next write
pub const STALE_CLAIM_SECS: f64 = 1800.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileClaim {
    pub session_id: String,
    pub claimed_at: f64,
}

impl FileClaim {
    pub fn is_stale(&self, now: f64) -> bool {
        now - self.claimed_at >= STALE_CLAIM_SECS
    }
}

pub type Claims = BTreeMap<String, FileClaim>;

/// Read the claims file under a shared lock. A missing file is empty;
/// an unparseable one is treated as empty too.
pub fn read_claims(paths: &Paths) -> Result<Claims> {
    let path = paths.claims_file();
    if !path.exists() {
        return Ok(Claims::new());
    }
    let _lock = FileLock::shared(&lock_path_for(&path))?;
    let content =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(serde_json::from_str(&content).unwrap_or_default())
}

/// Drop stale claims
pub fn clean_stale_claims(claims: Claims, now: f64) -> Claims {
    claims
        .into_iter()
        .filter(|(_, claim)| !claim.is_stale(now))
        .collect()
}

/// Record that `session_id` is editing `file_path`
pub fn claim_file(paths: &Paths, file_path: &str, session_id: &str, now: f64) -> Result<()> {
    let path = paths.claims_file();
    let _lock = FileLock::exclusive(&lock_path_for(&path))?;
    let existing: Claims = fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    let mut claims = clean_stale_claims(existing, now);
    claims.insert(
        file_path.to_string(),
        FileClaim {
            session_id: session_id.to_string(),
            claimed_at: now,
        },
    );
    write_json_atomic(&path, &claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_claim_and_read() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        assert!(read_claims(&paths).unwrap().is_empty());

        claim_file(&paths, "/p/a.py", "agent-1", 1000.0).unwrap();
        claim_file(&paths, "/p/b.py", "agent-2", 1100.0).unwrap();
        let claims = read_claims(&paths).unwrap();
        assert_eq!(claims["/p/a.py"].session_id, "agent-1");
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn test_stale_claims_dropped_on_write() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        claim_file(&paths, "/p/a.py", "agent-1", 0.0).unwrap();
        claim_file(&paths, "/p/b.py", "agent-2", 2000.0).unwrap();
        let claims = read_claims(&paths).unwrap();
        assert!(!claims.contains_key("/p/a.py"));
        assert!(claims.contains_key("/p/b.py"));
    }

    #[test]
    fn test_is_stale() {
        let claim = FileClaim {
            session_id: "x".into(),
            claimed_at: 100.0,
        };
        assert!(!claim.is_stale(100.0 + 1799.0));
        assert!(claim.is_stale(100.0 + 1800.0));
    }
}
