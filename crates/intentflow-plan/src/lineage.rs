//! Parent inference from dotted step labels.
//!
//! A step labelled `2.1` runs after the plain step `2` when one exists
//! (parallel branches hang off their own major step). Otherwise it runs after
//! every step of the previous major number, which is how plain sequences such
//! as `1.` / `2.` / `3.` chain together.

use serde::{Deserialize, Serialize};

/// How the previous major number is matched against other labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMatching {
    /// String-prefix test. `1` also matches `10`, `11.2`, ...
    Prefix,
    /// Integer equality on the text before the first dot.
    #[default]
    Major,
}

/// Text before the first dot, e.g. `"2"` for `"2.1"` and `"2."`.
fn major_part(label: &str) -> &str {
    label.split('.').next().unwrap_or(label)
}

fn major_number(label: &str) -> Option<u64> {
    major_part(label).parse().ok()
}

/// Returns, for each label, the indices of the labels it depends on.
///
/// Labels without a dot get no parents. A dotted label whose major part is not
/// an integer (e.g. `.5`) also gets none.
pub fn infer_parents(labels: &[&str], matching: LabelMatching) -> Vec<Vec<usize>> {
    labels
        .iter()
        .enumerate()
        .map(|(i, label)| parents_of(i, label, labels, matching))
        .collect()
}

fn parents_of(idx: usize, label: &str, labels: &[&str], matching: LabelMatching) -> Vec<usize> {
    if !label.contains('.') {
        return Vec::new();
    }
    let prefix = major_part(label);

    let siblings: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(j, other)| {
            *j != idx
                && !other.contains('.')
                && match matching {
                    LabelMatching::Prefix => other.starts_with(prefix),
                    LabelMatching::Major => **other == prefix,
                }
        })
        .map(|(j, _)| j)
        .collect();
    if !siblings.is_empty() {
        return siblings;
    }

    let Some(prev) = prefix.parse::<u64>().ok().and_then(|n| n.checked_sub(1)) else {
        return Vec::new();
    };
    labels
        .iter()
        .enumerate()
        .filter(|(j, other)| {
            *j != idx
                && match matching {
                    LabelMatching::Prefix => other.starts_with(&prev.to_string()),
                    LabelMatching::Major => major_number(other) == Some(prev),
                }
        })
        .map(|(j, _)| j)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parents(labels: &[&str], matching: LabelMatching) -> Vec<Vec<usize>> {
        infer_parents(labels, matching)
    }

    #[test]
    fn sequential_dotted_labels_chain() {
        let p = parents(&["1.", "2.", "3."], LabelMatching::Major);
        assert_eq!(p, vec![vec![], vec![0], vec![1]]);
    }

    #[test]
    fn undotted_labels_have_no_parents() {
        let p = parents(&["1", "2", "3"], LabelMatching::Major);
        assert!(p.iter().all(Vec::is_empty));
    }

    #[test]
    fn branches_hang_off_plain_sibling() {
        let p = parents(&["1.", "2", "2.1", "2.2"], LabelMatching::Major);
        assert_eq!(p[2], vec![1]);
        assert_eq!(p[3], vec![1]);
    }

    #[test]
    fn branches_without_sibling_follow_previous_major() {
        let p = parents(&["1.", "2.1", "2.2", "3."], LabelMatching::Major);
        assert_eq!(p[1], vec![0]);
        assert_eq!(p[2], vec![0]);
        // nested steps of the prior major still count
        assert_eq!(p[3], vec![1, 2]);
    }

    #[test]
    fn repeated_labels_are_all_parents() {
        let p = parents(&["1.", "1.", "2."], LabelMatching::Major);
        assert_eq!(p[2], vec![0, 1]);
    }

    #[test]
    fn major_mode_separates_one_and_ten() {
        let labels = ["1.", "10.", "2."];
        let p = parents(&labels, LabelMatching::Major);
        assert_eq!(p[2], vec![0]);
        // "10." looks for major 9, which does not exist
        assert!(p[1].is_empty());
    }

    #[test]
    fn prefix_mode_conflates_one_and_ten() {
        let labels = ["1.", "10.", "2."];
        let p = parents(&labels, LabelMatching::Prefix);
        assert_eq!(p[2], vec![0, 1]);
    }

    #[test]
    fn prefix_mode_sibling_lookup_uses_starts_with() {
        // "10" is an undotted label starting with "1", so it is a sibling of "1.1"
        let p = parents(&["10", "1.1"], LabelMatching::Prefix);
        assert_eq!(p[1], vec![0]);
        let p = parents(&["10", "1.1"], LabelMatching::Major);
        assert!(p[1].is_empty());
    }

    #[test]
    fn zero_major_and_non_numeric_prefix_have_no_parents() {
        let p = parents(&["0.1", ".5", "1."], LabelMatching::Major);
        assert!(p[0].is_empty());
        assert!(p[1].is_empty());
        assert_eq!(p[2], vec![0]);
    }
}
