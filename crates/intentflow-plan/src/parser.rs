use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use winnow::ascii::{space0, space1};
use winnow::combinator::opt;
use winnow::token::{rest, take_while};
use winnow::{ModalResult, Parser};

use crate::ast::*;
use crate::catalog::ModuleCatalog;
use crate::lineage::{infer_parents, LabelMatching};

static CANDIDATE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Candidate-\d+[^\n\r]*?:").expect("valid header pattern"));

/// Id given to the whole text when it carries no candidate headers.
pub const FALLBACK_CANDIDATE_ID: &str = "cand_1";

// ---------------------------------------------------------------------------
// Step-line grammar
// ---------------------------------------------------------------------------

/// Dotted step number: one or more digits and dots (`1`, `2.`, `2.1`).
fn step_label<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| c.is_ascii_digit() || c == '.').parse_next(input)
}

/// `<dotted-number><whitespace><name>`; the name is everything after the gap.
fn step_line<'i>(input: &mut &'i str) -> ModalResult<(&'i str, &'i str)> {
    let label = step_label.parse_next(input)?;
    space1.parse_next(input)?;
    let name = rest.parse_next(input)?;
    Ok((label, name))
}

/// Like [`step_line`] but the gap is optional, and a line without a step
/// number is all name.
fn sequence_line<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    let _ = opt((step_label, space0)).parse_next(input)?;
    rest.parse_next(input)
}

fn parse_step_line(line: &str) -> Option<(&str, &str)> {
    step_line
        .parse(line)
        .ok()
        .filter(|(_, name)| !name.trim().is_empty())
}

fn parse_sequence_line(line: &str) -> &str {
    sequence_line.parse(line).unwrap_or(line)
}

// ---------------------------------------------------------------------------
// Candidate splitting
// ---------------------------------------------------------------------------

/// Splits one generation round into candidates, in the order they appear.
///
/// A header is `Candidate-<n>` followed by anything up to the first colon on
/// the same line (`Candidate-2 (with parallel step):`). Text before the first
/// header is dropped. Without any header the whole text is a single candidate
/// named [`FALLBACK_CANDIDATE_ID`]. A repeated label gets a `#<n>` suffix so
/// ids stay unique within the round.
pub fn split_candidates(text: &str) -> Vec<Candidate> {
    let headers: Vec<_> = CANDIDATE_HEADER.find_iter(text).collect();
    if headers.is_empty() {
        return vec![Candidate {
            id: FALLBACK_CANDIDATE_ID.to_string(),
            text: text.trim().to_string(),
        }];
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let body_end = headers.get(i + 1).map(|h| h.start()).unwrap_or(text.len());
            let label = header
                .as_str()
                .trim_end_matches(':')
                .trim()
                .to_string();
            let count = seen.entry(label.clone()).or_insert(0);
            *count += 1;
            let id = if *count == 1 {
                label
            } else {
                format!("{label}#{count}")
            };
            Candidate {
                id,
                text: text[header.end()..body_end].trim().to_string(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// CandidateParser
// ---------------------------------------------------------------------------

/// Turns candidate text into graphs, module sequences and pipeline keys,
/// canonicalizing module names through the catalog.
#[derive(Debug, Clone)]
pub struct CandidateParser {
    catalog: Arc<ModuleCatalog>,
    matching: LabelMatching,
}

impl CandidateParser {
    pub fn new(catalog: Arc<ModuleCatalog>) -> Self {
        Self {
            catalog,
            matching: LabelMatching::default(),
        }
    }

    pub fn with_matching(mut self, matching: LabelMatching) -> Self {
        self.matching = matching;
        self
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    pub fn split(&self, text: &str) -> Vec<Candidate> {
        split_candidates(text)
    }

    /// Builds the node/edge graph implied by the step numbering.
    ///
    /// Lines that are not step lines are skipped. Nodes are deduplicated in
    /// first-seen order; duplicate and self-loop edges are dropped.
    pub fn parse_to_graph(&self, text: &str) -> ParsedGraph {
        let steps: Vec<Step> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(parse_step_line)
            .map(|(label, name)| Step {
                label: label.to_string(),
                module: self.catalog.canonicalize(name.trim_end_matches('.')),
            })
            .collect();

        let mut nodes = Vec::new();
        let mut seen_nodes = HashSet::new();
        for step in &steps {
            if seen_nodes.insert(step.module.as_str()) {
                nodes.push(step.module.clone());
            }
        }

        let labels: Vec<&str> = steps.iter().map(|s| s.label.as_str()).collect();
        let parents = infer_parents(&labels, self.matching);

        let mut edges = Vec::new();
        let mut seen_edges = HashSet::new();
        for (child, parent_ids) in parents.iter().enumerate() {
            let to = &steps[child].module;
            for &parent in parent_ids {
                let from = &steps[parent].module;
                if from == to {
                    continue;
                }
                let edge = Edge::new(from.as_str(), to.as_str());
                if seen_edges.insert(edge.clone()) {
                    edges.push(edge);
                }
            }
        }

        ParsedGraph {
            nodes,
            edges,
            steps,
        }
    }

    /// The ordered module list of a candidate, duplicates kept.
    ///
    /// Every non-empty line except `Candidate...` headers contributes one
    /// module; a leading step number is stripped when present.
    pub fn module_sequence(&self, text: &str) -> Vec<String> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.to_lowercase().starts_with("candidate"))
            .map(|line| parse_sequence_line(line).trim_end_matches('.'))
            .filter(|name| !name.trim().is_empty())
            .map(|name| self.catalog.canonicalize(name))
            .collect()
    }

    /// Canonical `" > "`-joined module sequence, used as the blacklist key.
    pub fn pipeline_key(&self, text: &str) -> String {
        self.module_sequence(text).join(" > ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> CandidateParser {
        CandidateParser::new(Arc::new(ModuleCatalog::builtin().unwrap()))
    }

    #[test]
    fn step_line_grammar() {
        assert_eq!(parse_step_line("2.1 LSTM-Predictor"), Some(("2.1", "LSTM-Predictor")));
        assert_eq!(parse_step_line("3.\tWireless Controller"), Some(("3.", "Wireless Controller")));
        assert_eq!(parse_step_line("2.1LSTM"), None);
        assert_eq!(parse_step_line("- UE-Monitor"), None);
        assert_eq!(parse_step_line("1."), None);
    }

    #[test]
    fn sequence_line_grammar() {
        assert_eq!(parse_sequence_line("1. UE-Monitor"), "UE-Monitor");
        assert_eq!(parse_sequence_line("2.1LSTM"), "LSTM");
        assert_eq!(parse_sequence_line("YOLO"), "YOLO");
    }

    #[test]
    fn split_candidates_by_header() {
        let raw = "Here you go\nCandidate-1:\n  1. UE-Monitor\n  2. YOLO\ncandidate-2 (with parallel step):\n  1. Wireless-Monitor\n  2.1 LSTM-Predictor\n";
        let cands = split_candidates(raw);
        assert_eq!(cands.len(), 2);
        assert_eq!(cands[0].id, "Candidate-1");
        assert_eq!(cands[0].text, "1. UE-Monitor\n  2. YOLO");
        assert_eq!(cands[1].id, "candidate-2 (with parallel step)");
        assert!(cands[1].text.ends_with("2.1 LSTM-Predictor"));
    }

    #[test]
    fn split_without_header_is_single_candidate() {
        let cands = split_candidates("  1. UE-Monitor\n2. YOLO\n");
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].id, FALLBACK_CANDIDATE_ID);
        assert_eq!(cands[0].text, "1. UE-Monitor\n2. YOLO");
    }

    #[test]
    fn split_disambiguates_repeated_labels() {
        let cands = split_candidates("Candidate-1:\n1. A\nCandidate-1:\n1. B\n");
        assert_eq!(cands[0].id, "Candidate-1");
        assert_eq!(cands[1].id, "Candidate-1#2");
    }

    #[test]
    fn graph_nodes_are_unique_in_first_seen_order() {
        let g = parser().parse_to_graph("1. UE Monitor\n2. YOLO\n3. ue-monitor\n4. YOLO");
        assert_eq!(g.nodes, vec!["UE-Monitor", "YOLO"]);
        assert_eq!(g.steps.len(), 4);
        assert!(g.edges.iter().all(|e| e.from != e.to));
        // steps 3 -> 4 repeat the UE-Monitor -> YOLO edge
        assert_eq!(
            g.edges,
            vec![Edge::new("UE-Monitor", "YOLO"), Edge::new("YOLO", "UE-Monitor")]
        );
    }

    #[test]
    fn graph_drops_self_loops() {
        let g = parser().parse_to_graph("1. YOLO\n2. yolo");
        assert_eq!(g.nodes, vec!["YOLO"]);
        assert!(g.edges.is_empty());
    }

    #[test]
    fn graph_parallel_branches() {
        let text = "1. UE-Monitor\n1. Wireless-Monitor\n2. LSTM-Predictor\n3. Wireless-Controller";
        let g = parser().parse_to_graph(text);
        assert_eq!(g.nodes.len(), 4);
        assert!(g.contains_edge("UE-Monitor", "LSTM-Predictor"));
        assert!(g.contains_edge("Wireless-Monitor", "LSTM-Predictor"));
        assert!(g.contains_edge("LSTM-Predictor", "Wireless-Controller"));
        assert_eq!(g.edges.len(), 3);
    }

    #[test]
    fn graph_branch_under_plain_major() {
        let text = "1. Wireless-Monitor\n2 Split-Computing-Ctrl\n2.1 LSTM-Predictor\n2.2 Semantic-Codec";
        let g = parser().parse_to_graph(text);
        assert!(g.contains_edge("Split-Computing-Ctrl", "LSTM-Predictor"));
        assert!(g.contains_edge("Split-Computing-Ctrl", "Semantic-Codec"));
        // an undotted step has no inferred parents
        assert!(!g.contains_edge("Wireless-Monitor", "Split-Computing-Ctrl"));
    }

    #[test]
    fn graph_ignores_unparseable_lines() {
        let g = parser().parse_to_graph("Candidate-1:\nsome prose\n1. YOLO\n\n- bullet");
        assert_eq!(g.nodes, vec!["YOLO"]);
    }

    #[test]
    fn pipeline_key_canonicalizes_spellings() {
        let p = parser();
        let a = p.pipeline_key("1. UE Monitor\n2. YOLO");
        let b = p.pipeline_key("1. ue-monitor\n2. yolo.");
        let c = p.pipeline_key("1. UE\u{2014}Monitor\n2. YOLO");
        assert_eq!(a, "UE-Monitor > YOLO");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn module_sequence_keeps_duplicates_and_skips_headers() {
        let seq = parser().module_sequence("Candidate-3:\n1. YOLO\nUE Monitor\n2. YOLO\n");
        assert_eq!(seq, vec!["YOLO", "UE-Monitor", "YOLO"]);
    }

    #[test]
    fn legacy_matching_conflates_majors() {
        let text = (1..=10)
            .map(|i| format!("{i}. M{i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let catalog = Arc::new(ModuleCatalog::builtin().unwrap());
        let legacy = CandidateParser::new(catalog.clone()).with_matching(LabelMatching::Prefix);
        let strict = CandidateParser::new(catalog);
        // "2." matches "1." and "10." by string prefix
        assert!(legacy.parse_to_graph(&text).contains_edge("m10", "m2"));
        assert!(!strict.parse_to_graph(&text).contains_edge("m10", "m2"));
    }
}
