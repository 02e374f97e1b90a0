//! Phase 5 — coverage extraction.
//!
//! Scans a job's combined log with its `coverage:` regex and records the
//! first numeric substring of the first match. No match yields `"0"`,
//! matching the tool this was ported from.

use once_cell::sync::Lazy;
use regex::Regex;

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(\.\d+)?").unwrap());

/// Strips optional `/…/` delimiters some pipeline authors carry over from
/// JavaScript regex literals.
fn strip_delimiters(pattern: &str) -> &str {
    pattern.strip_prefix('/').and_then(|p| p.strip_suffix('/')).unwrap_or(pattern)
}

/// Extracts the coverage percentage from `log` using `pattern`, which is
/// itself a regex with one or more capture groups — the first group or,
/// lacking one, the first numeric run in the overall match is used.
#[must_use]
pub fn extract(log: &str, pattern: &str) -> String {
    let pattern = strip_delimiters(pattern);
    let Ok(re) = Regex::new(pattern) else {
        return "0".to_string();
    };

    let Some(captures) = re.captures(log) else {
        return "0".to_string();
    };

    let matched_text = captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str())
        .unwrap_or_default();

    NUMBER
        .find(matched_text)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "0".to_string())
}
