//! Code list input adapter.

/// Prefixes of lines that are comments or separators, not codes.
const SKIP_PREFIXES: &[&str] = &["#", "==="];

/// Split pasted text into an ordered list of codes.
///
/// Lines are trimmed; blank lines and lines starting with `#` or `===` are
/// dropped. Duplicates and order are preserved, and nothing else about the
/// code syntax is checked.
pub fn parse_codes(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !SKIP_PREFIXES.iter().any(|prefix| line.starts_with(prefix)))
        .map(str::to_owned)
        .collect()
}
