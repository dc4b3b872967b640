use serde::{Deserialize, Serialize};

/// One proposed pipeline from a generation round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub text: String,
}

/// A numbered step line, e.g. `2.1 LSTM-Predictor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// The dotted number exactly as written (`"2."`, `"2.1"`).
    pub label: String,
    /// Canonical module name.
    pub module: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Node list + edge list inferred from one candidate's step numbering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedGraph {
    /// Canonical module names, deduplicated, first-seen order.
    pub nodes: Vec<String>,
    /// Deduplicated edges; never contains a self-loop.
    pub edges: Vec<Edge>,
    pub steps: Vec<Step>,
}

impl ParsedGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_edge(&self, from: &str, to: &str) -> bool {
        self.edges.iter().any(|e| e.from == from && e.to == to)
    }
}
