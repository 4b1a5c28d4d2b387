//! Template placeholder syntax
//!
//! Placeholders are `%%NAME%%` with NAME drawn from `[A-Z0-9_]`. A rendered
//! header must contain none.

use regex_lite::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Regex source matching any placeholder-shaped token
pub const PLACEHOLDER_PATTERN: &str = r"%%([A-Z0-9_]+)%%";

/// Compiled placeholder regex
pub fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLACEHOLDER_PATTERN).expect("placeholder pattern is valid"))
}

/// Render a placeholder token for a name
pub fn placeholder(name: &str) -> String {
    format!("%%{}%%", name)
}

/// Sorted, de-duplicated names of every placeholder left in `text`
pub fn find_placeholders(text: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
