use std::collections::HashMap;

use intentflow_plan::{Edge, ParsedGraph};

/// Adjacency view over a candidate's module graph.
///
/// Node order is preserved as given; nodes that appear only as edge endpoints
/// are appended after the declared nodes in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: Vec<String>,
    edges: Vec<Edge>,
    predecessors: HashMap<String, Vec<String>>,
    successors: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    pub fn new(nodes: Vec<String>, edges: Vec<Edge>) -> Self {
        let mut graph = Self {
            nodes: Vec::with_capacity(nodes.len()),
            edges: Vec::with_capacity(edges.len()),
            predecessors: HashMap::new(),
            successors: HashMap::new(),
        };
        for node in nodes {
            graph.add_node(node);
        }
        for edge in edges {
            graph.add_node(edge.from.clone());
            graph.add_node(edge.to.clone());
            let succ = graph.successors.entry(edge.from.clone()).or_default();
            if succ.contains(&edge.to) {
                continue;
            }
            succ.push(edge.to.clone());
            graph
                .predecessors
                .entry(edge.to.clone())
                .or_default()
                .push(edge.from.clone());
            graph.edges.push(edge);
        }
        graph
    }

    pub fn from_parsed(parsed: &ParsedGraph) -> Self {
        Self::new(parsed.nodes.clone(), parsed.edges.clone())
    }

    fn add_node(&mut self, node: String) {
        if !self.predecessors.contains_key(&node) {
            self.predecessors.insert(node.clone(), Vec::new());
            self.successors.insert(node.clone(), Vec::new());
            self.nodes.push(node);
        }
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn contains(&self, node: &str) -> bool {
        self.predecessors.contains_key(node)
    }

    pub fn predecessors(&self, node: &str) -> &[String] {
        self.predecessors.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors(&self, node: &str) -> &[String] {
        self.successors.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
