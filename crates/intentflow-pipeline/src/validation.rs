//! Graph validation: lint rules and diagnostics.
//!
//! Two built-in rules guard promotion of a candidate to a workflow:
//! [`AcyclicRule`] and [`RequiredPredecessorsRule`]. Call [`validate`] for the
//! collected diagnostics or [`validate_or_raise`] to fail on any
//! `Error`-severity issue. The boolean checks [`is_dag`] and
//! [`verify_dependencies`] are available on their own.

use std::collections::{HashMap, HashSet};

use intentflow_plan::ModuleCatalog;
use intentflow_types::{IntentflowError, Result};

use crate::graph::TaskGraph;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// DependencyTable
// ---------------------------------------------------------------------------

/// Modules that must directly precede a given module in any valid graph.
pub trait DependencyTable: Send + Sync {
    fn required_predecessors(&self, module: &str) -> Vec<String>;
}

impl DependencyTable for ModuleCatalog {
    fn required_predecessors(&self, module: &str) -> Vec<String> {
        ModuleCatalog::required_predecessors(self, module).to_vec()
    }
}

impl DependencyTable for HashMap<String, Vec<String>> {
    fn required_predecessors(&self, module: &str) -> Vec<String> {
        self.get(module).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &TaskGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// First back-edge found by a depth-first walk, or `None` for a DAG.
pub fn find_back_edge(graph: &TaskGraph) -> Option<(String, String)> {
    let mut color: HashMap<&str, Color> = graph
        .nodes()
        .iter()
        .map(|n| (n.as_str(), Color::White))
        .collect();

    for root in graph.nodes() {
        if color[root.as_str()] != Color::White {
            continue;
        }
        // (node, index of the next successor to visit)
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        color.insert(root.as_str(), Color::Grey);

        while let Some((node, next)) = stack.pop() {
            let succs = graph.successors(node);
            if next < succs.len() {
                stack.push((node, next + 1));
                let child = succs[next].as_str();
                match color.get(child).copied().unwrap_or(Color::White) {
                    Color::Grey => return Some((node.to_string(), child.to_string())),
                    Color::White => {
                        color.insert(child, Color::Grey);
                        stack.push((child, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color.insert(node, Color::Black);
            }
        }
    }
    None
}

pub fn is_dag(graph: &TaskGraph) -> bool {
    find_back_edge(graph).is_none()
}

// ---------------------------------------------------------------------------
// Required predecessors
// ---------------------------------------------------------------------------

/// A node whose configured predecessors are not all direct predecessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPredecessors {
    pub node: String,
    pub missing: Vec<String>,
}

pub fn missing_predecessors(
    graph: &TaskGraph,
    table: &dyn DependencyTable,
) -> Vec<MissingPredecessors> {
    graph
        .nodes()
        .iter()
        .filter_map(|node| {
            let actual: HashSet<&str> = graph.predecessors(node).iter().map(String::as_str).collect();
            let missing: Vec<String> = table
                .required_predecessors(node)
                .into_iter()
                .filter(|req| !actual.contains(req.as_str()))
                .collect();
            (!missing.is_empty()).then(|| MissingPredecessors {
                node: node.clone(),
                missing,
            })
        })
        .collect()
}

/// `true` when every node has all of its required predecessors.
pub fn verify_dependencies(graph: &TaskGraph, table: &dyn DependencyTable) -> bool {
    let failures = missing_predecessors(graph, table);
    for f in &failures {
        tracing::warn!(node = %f.node, missing = ?f.missing, "Missing required predecessors");
    }
    failures.is_empty()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

pub struct AcyclicRule;

impl LintRule for AcyclicRule {
    fn name(&self) -> &str {
        "acyclic"
    }

    fn apply(&self, graph: &TaskGraph) -> Vec<Diagnostic> {
        match find_back_edge(graph) {
            Some((from, to)) => vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Graph contains a cycle: edge {from} -> {to} closes a loop"),
                node_id: Some(to.clone()),
                edge: Some((from, to)),
                fix: Some("Renumber the steps so every edge points forward".into()),
            }],
            None => vec![],
        }
    }
}

pub struct RequiredPredecessorsRule<'a> {
    table: &'a dyn DependencyTable,
}

impl<'a> RequiredPredecessorsRule<'a> {
    pub fn new(table: &'a dyn DependencyTable) -> Self {
        Self { table }
    }
}

impl LintRule for RequiredPredecessorsRule<'_> {
    fn name(&self) -> &str {
        "required_predecessors"
    }

    fn apply(&self, graph: &TaskGraph) -> Vec<Diagnostic> {
        missing_predecessors(graph, self.table)
            .into_iter()
            .map(|m| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!(
                    "Node '{}' is missing required predecessors: {}",
                    m.node,
                    m.missing.join(", ")
                ),
                fix: Some(format!(
                    "Place {} in the step immediately before '{}'",
                    m.missing.join(", "),
                    m.node
                )),
                node_id: Some(m.node),
                edge: None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &TaskGraph, table: &dyn DependencyTable) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule + '_>> = vec![
        Box::new(AcyclicRule),
        Box::new(RequiredPredecessorsRule::new(table)),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(
    graph: &TaskGraph,
    table: &dyn DependencyTable,
) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph, table);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(IntentflowError::ValidationError(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
