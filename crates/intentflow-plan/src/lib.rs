//! Candidate text handling for the intentflow loop.
//!
//! Splits a generator response into candidates, parses numbered step lines
//! into a [`ParsedGraph`], and derives the canonical module sequence and
//! pipeline key of a candidate. Module names are canonicalized through the
//! [`ModuleCatalog`], which also holds the per-intent requirement specs.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use intentflow_plan::{CandidateParser, ModuleCatalog};
//!
//! let catalog = Arc::new(ModuleCatalog::builtin().unwrap());
//! let parser = CandidateParser::new(catalog);
//! let graph = parser.parse_to_graph("1. UE Monitor\n2. YOLO");
//! assert_eq!(graph.nodes, vec!["UE-Monitor", "YOLO"]);
//! assert_eq!(parser.pipeline_key("1. ue-monitor\n2. yolo"), "UE-Monitor > YOLO");
//! ```

pub mod ast;
pub mod canon;
pub mod catalog;
pub mod lineage;
mod parser;

pub use ast::*;
pub use canon::normalize;
pub use catalog::{
    Catalog, GroupKind, IntentSpec, ModuleCatalog, ModuleSpec, RequirementGroup, RequirementSpec,
};
pub use lineage::{infer_parents, LabelMatching};
pub use parser::{split_candidates, CandidateParser, FALLBACK_CANDIDATE_ID};
