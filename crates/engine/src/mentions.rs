use std::sync::LazyLock;

use regex::Regex;

/// `@` followed by one or more ASCII word characters.
static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9_]+)").expect("mention pattern is valid"));

/// Extract mentioned handles in order of appearance.
///
/// Duplicates and case are preserved. Whether a handle belongs to a real
/// user is left to the caller.
pub fn extract_mentions(text: &str) -> Vec<String> {
    MENTION
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}
