use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use intentflow_plan::{CandidateParser, GroupKind, RequirementSpec};
use intentflow_types::{Result, Verdict};

/// Scores candidates against the requirement spec registered for an intent.
pub struct Evaluator {
    parser: Arc<CandidateParser>,
}

impl Evaluator {
    pub fn new(parser: Arc<CandidateParser>) -> Self {
        Self { parser }
    }

    /// Look up the intent's requirement spec and score the candidate text.
    pub fn evaluate(&self, intent: &str, text: &str) -> Result<Verdict> {
        let spec = self.parser.catalog().requirements(intent)?;
        let modules = self.parser.module_sequence(text);
        Ok(score(spec, &modules))
    }
}

/// Score an ordered module sequence against a requirement spec.
///
/// Groups are checked in order. `all` needs every module present, `any` at
/// least one; both contribute their matched modules to the mandatory set and
/// must start no earlier than the previous group's last match. `opt` matches
/// are tolerated anywhere. Anything left over makes the verdict partial.
///
/// Positions index the *last* occurrence of a repeated module.
pub fn score(spec: &RequirementSpec, modules: &[String]) -> Verdict {
    let mut position: HashMap<&str, usize> = HashMap::new();
    for (i, m) in modules.iter().enumerate() {
        position.insert(m.as_str(), i);
    }
    let present: BTreeSet<&str> = position.keys().copied().collect();

    let mut mandatory: BTreeSet<&str> = BTreeSet::new();
    let mut optional: BTreeSet<&str> = BTreeSet::new();
    let mut prev_max: Option<usize> = None;

    for group in spec.groups() {
        let hit: Vec<&str> = group
            .modules
            .iter()
            .map(String::as_str)
            .filter(|m| present.contains(m))
            .collect();

        match group.kind {
            GroupKind::All => {
                if hit.len() != group.modules.len() {
                    return Verdict::bad();
                }
                mandatory.extend(hit.iter().copied());
            }
            GroupKind::Any => {
                if hit.is_empty() {
                    return Verdict::bad();
                }
                mandatory.extend(hit.iter().copied());
            }
            GroupKind::Opt => {
                optional.extend(hit.iter().copied());
                continue;
            }
        }

        let positions = hit.iter().map(|m| position[m]);
        let (Some(lo), Some(hi)) = (positions.clone().min(), positions.max()) else {
            continue;
        };
        if prev_max.is_some_and(|p| lo < p) {
            return Verdict::bad();
        }
        prev_max = Some(hi);
    }

    let extra = present
        .iter()
        .any(|m| !mandatory.contains(m) && !optional.contains(m));
    if extra {
        Verdict::partial()
    } else {
        Verdict::perfect()
    }
}
