//! Tiered file exemptions shared by the gates.
//!
//! * base: empty paths, bookkeeping basenames, anything under the skills dir
//! * standard: base plus test/spec files
//! * full: standard plus non-code extensions

use crate::hook::{basename, extension, normpath};
use std::path::Path;

const BASE_EXEMPT_BASENAMES: &[&str] = &[
    "state.json",
    "HANDOFF.md",
    "LIVE_STATE.json",
    "CLAUDE.md",
    "__init__.py",
];

const STANDARD_EXEMPT_PATTERNS: &[&str] = &["test_", "_test.", ".test.", "spec_", "_spec.", ".spec."];

const FULL_EXEMPT_EXTENSIONS: &[&str] = &[
    ".md", ".json", ".yaml", ".yml", ".toml", ".cfg", ".ini", ".txt", ".sh", ".bash", ".css",
    ".html", ".xml", ".csv", ".lock",
];

/// Exemption checks bound to a skills directory
#[derive(Debug, Clone)]
pub struct Exemptions {
    skills_dir: String,
}

impl Exemptions {
    pub fn new(skills_dir: &Path) -> Self {
        Self {
            skills_dir: normpath(&skills_dir.to_string_lossy()),
        }
    }

    pub fn is_exempt_base(&self, file_path: &str) -> bool {
        if file_path.is_empty() {
            return true;
        }
        if BASE_EXEMPT_BASENAMES.contains(&basename(file_path)) {
            return true;
        }
        let norm = normpath(file_path);
        norm == self.skills_dir || norm.starts_with(&format!("{}/", self.skills_dir))
    }

    pub fn is_exempt_standard(&self, file_path: &str) -> bool {
        if self.is_exempt_base(file_path) {
            return true;
        }
        let lower = basename(file_path).to_lowercase();
        STANDARD_EXEMPT_PATTERNS.iter().any(|p| lower.contains(p))
    }

    pub fn is_exempt_full(&self, file_path: &str) -> bool {
        if self.is_exempt_standard(file_path) {
            return true;
        }
        FULL_EXEMPT_EXTENSIONS.contains(&extension(file_path).as_str())
    }
}

/// Test files by naming convention: `test_*`, `*_test`, `*_spec`, `*.test`, `*.spec`
pub fn is_test_file(file_path: &str) -> bool {
    if file_path.is_empty() {
        return false;
    }
    let base = basename(file_path);
    let stem = crate::hook::file_stem(file_path);
    stem.starts_with("test_")
        || stem.ends_with("_test")
        || stem.ends_with("_spec")
        || stem.ends_with(".test")
        || stem.ends_with(".spec")
        || base.starts_with("test_")
}

/// Stem with test prefixes/suffixes removed, lowercased, so `foo.py` and `test_foo.py` match
pub fn stem_normalize(file_path: &str) -> String {
    if file_path.is_empty() {
        return String::new();
    }
    let mut stem = crate::hook::file_stem(file_path);
    for prefix in ["test_", "test"] {
        if let Some(rest) = stem.strip_prefix(prefix) {
            stem = rest;
            break;
        }
    }
    for suffix in ["_test", "_spec", ".test", ".spec"] {
        if let Some(rest) = stem.strip_suffix(suffix) {
            stem = rest;
            break;
        }
    }
    stem.to_lowercase()
}

/// Same basename, or the same normalized stem
pub fn is_related_file(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    basename(a) == basename(b) || stem_normalize(a) == stem_normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exemptions() -> Exemptions {
        Exemptions::new(Path::new("/home/u/.claude/skills"))
    }

    #[test]
    fn test_base_exemptions() {
        let ex = exemptions();
        assert!(ex.is_exempt_base(""));
        assert!(ex.is_exempt_base("/proj/pkg/__init__.py"));
        assert!(ex.is_exempt_base("/home/u/.claude/skills/fix/SKILL.md"));
        assert!(ex.is_exempt_base("/home/u/.claude/skills"));
        assert!(!ex.is_exempt_base("/home/u/.claude/skillsx/a.py"));
        assert!(!ex.is_exempt_base("/proj/app.py"));
    }

    #[test]
    fn test_standard_exemptions() {
        let ex = exemptions();
        assert!(ex.is_exempt_standard("/proj/test_app.py"));
        assert!(ex.is_exempt_standard("/proj/App.Test.tsx"));
        assert!(ex.is_exempt_standard("/proj/app_spec.rb"));
        assert!(!ex.is_exempt_standard("/proj/app.py"));
    }

    #[test]
    fn test_full_exemptions() {
        let ex = exemptions();
        assert!(ex.is_exempt_full("/proj/README.md"));
        assert!(ex.is_exempt_full("/proj/Cargo.lock"));
        assert!(!ex.is_exempt_full("/proj/main.rs"));
    }

    #[test]
    fn test_is_test_file() {
        assert!(is_test_file("/a/test_foo.py"));
        assert!(is_test_file("/a/foo_test.go"));
        assert!(is_test_file("/a/foo.spec.ts"));
        assert!(!is_test_file("/a/contest.py"));
        assert!(!is_test_file(""));
    }

    #[test]
    fn test_related_files() {
        assert!(is_related_file("/a/foo.py", "/b/foo.py"));
        assert!(is_related_file("/a/foo.py", "/a/test_foo.py"));
        assert!(is_related_file("/a/foo.ts", "/a/foo.spec.ts"));
        assert!(!is_related_file("/a/foo.py", "/a/bar.py"));
        assert!(!is_related_file("", "/a/bar.py"));
    }
}
