//! Module-name normalization.
//!
//! Generators spell module names loosely: `UE Monitor`, `ue-monitor`,
//! `UE—Monitor` (em dash), or with a non-breaking space. [`normalize`] folds
//! all of these into one lookup key; the catalog maps that key back to the
//! canonical casing.

/// Dash variants folded into an ASCII hyphen.
const DASHES: &[char] = &['\u{2010}', '\u{2011}', '\u{2012}', '\u{2013}', '\u{2014}', '\u{2212}'];

/// Lookup key for a module name: dashes and non-breaking spaces folded,
/// whitespace runs collapsed, trimmed, lowercased.
pub fn normalize(name: &str) -> String {
    let folded: String = name
        .chars()
        .map(|c| {
            if DASHES.contains(&c) {
                '-'
            } else if c == '\u{a0}' {
                ' '
            } else {
                c
            }
        })
        .collect();

    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Same key as [`normalize`] but also treats spaces and hyphens alike, so
/// `ue monitor` and `ue-monitor` collide.
pub(crate) fn loose_key(name: &str) -> String {
    normalize(name).replace(' ', "-")
}
