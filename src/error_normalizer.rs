//! Stable fingerprints for error messages.
//!
//! Two errors that differ only in paths, ids, timestamps or numbers normalize
//! to the same text and therefore the same hash, which is what ties fix
//! attempts across sessions together.

use once_cell::sync::Lazy;
use regex::Regex;

struct Strip {
    pattern: Regex,
    replacement: &'static str,
}

fn strip(pattern: &str, replacement: &'static str) -> Strip {
    Strip {
        pattern: Regex::new(pattern).expect("static normalizer pattern"),
        replacement,
    }
}

/// Applied in order; later patterns see earlier replacements
static STRIP_PATTERNS: Lazy<Vec<Strip>> = Lazy::new(|| {
    vec![
        strip(r"(?:[A-Za-z]:)?[/\\][\w./\\-]+", "<path>"),
        strip(
            r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            "<uuid>",
        ),
        strip(r"0x[0-9a-fA-F]+", "<hex>"),
        strip(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}[\w.:+-]*", "<ts>"),
        strip(r"\b[0-9a-f]{40}\b", "<git-hash>"),
        strip(r"\b[0-9a-f]{7}\b", "<git-short>"),
        strip(r"tmp[a-zA-Z0-9_]{6,10}", "<tmp>"),
        strip(r"<\w+ object at (?:0x[0-9a-fA-F]+|<hex>)>", "<obj-repr>"),
        // The terminator is captured and put back so it stays available
        strip(r":\d{2,5}(/|\s|$)", ":<port>${1}"),
        strip(r"(?i)\b\d+\s*(?:bytes?|[KMG]B)\b", "<mem-size>"),
        strip(r",\s*line\s+\d+", ", line <n>"),
        strip(r"\d{2,}", "<n>"),
    ]
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static pattern"));

/// Strip variable parts from an error message
pub fn normalize_error(raw: &str) -> String {
    let mut text = raw.to_string();
    for strip in STRIP_PATTERNS.iter() {
        text = strip
            .pattern
            .replace_all(&text, strip.replacement)
            .into_owned();
    }
    WHITESPACE
        .replace_all(&text, " ")
        .trim()
        .to_lowercase()
}

const FNV64_OFFSET: u64 = 14_695_981_039_346_656_037;
const FNV64_PRIME: u64 = 1_099_511_628_211;

/// FNV-1a 64-bit over the UTF-8 bytes, first 8 hex digits
pub fn fnv1a_hash(text: &str) -> String {
    let mut h = FNV64_OFFSET;
    for byte in text.as_bytes() {
        h ^= u64::from(*byte);
        h = h.wrapping_mul(FNV64_PRIME);
    }
    format!("{:016x}", h)[..8].to_string()
}

/// `(normalized_text, hash)` for an error message
pub fn error_signature(raw: &str) -> (String, String) {
    let normalized = normalize_error(raw);
    let hash = fnv1a_hash(&normalized);
    (normalized, hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_and_lines_collapse() {
        let a = normalize_error("File \"/home/a/app.py\", line 42, in run");
        let b = normalize_error("File \"/srv/other/app.py\", line 7, in run");
        assert_eq!(a, b);
        assert_eq!(a, "file \"<path>\", line <n>, in run");
    }

    #[test]
    fn test_port_keeps_terminator() {
        assert_eq!(
            normalize_error("Connection refused on localhost:8080 now"),
            "connection refused on localhost:<port> now"
        );
        assert_eq!(normalize_error("host:443"), "host:<port>");
    }

    #[test]
    fn test_uuid_hex_and_sizes() {
        let text = normalize_error(
            "Session 123e4567-e89b-12d3-a456-426614174000 at 0xdeadbeef ran out of 512 MB",
        );
        assert_eq!(text, "session <uuid> at <hex> ran out of <mem-size>");
    }

    #[test]
    fn test_fnv_known_values() {
        // FNV-1a of the empty string is the offset basis
        assert_eq!(fnv1a_hash(""), "cbf29ce4");
        assert_eq!(fnv1a_hash("a"), "af63dc4c");
        assert_eq!(fnv1a_hash("abc").len(), 8);
    }

    #[test]
    fn test_error_signature_is_stable() {
        let (n1, h1) = error_signature("ImportError: No module named foo at /x/y.py");
        let (n2, h2) = error_signature("ImportError: No module named foo at /z/w.py");
        assert_eq!(n1, n2);
        assert_eq!(h1, h2);
    }
}
