//! Round controller, evaluator, feedback ledger, graph validation and workflow
//! compiler.
//!
//! This crate implements the intentflow selection loop: generate candidate
//! pipelines for an intent, pick one with Thompson sampling, score it against
//! the intent's requirement spec, remember the outcome, and once a pipeline
//! keeps winning, validate it and compile it into an Argo workflow.

pub mod compiler;
pub mod controller;
pub mod evaluator;
pub mod events;
pub mod graph;
pub mod ledger;
pub mod metrics;
pub mod prompt;
pub mod retry;
pub mod submit;
pub mod validation;

pub use compiler::{
    sanitize_name, CompileOptions, DirManifestRegistry, ManifestRegistry, Workflow,
    WorkflowCompiler, ENTRYPOINT,
};
pub use controller::{
    intent_slug, summary_line, ControllerParts, ControllerSettings, PhaseConfig, RoundController,
};
pub use evaluator::{score, Evaluator};
pub use events::{EventEmitter, RoundEvent};
pub use graph::TaskGraph;
pub use ledger::{
    one_line, render_feedback, Blacklist, BlacklistStore, CorpusDocument, DocumentKind,
    FeedbackCorpus, FeedbackLedger, InMemoryCorpus, JsonBlacklistStore, JsonlCorpus,
};
pub use metrics::MetricsLog;
pub use prompt::{LlmGenerator, PromptBuilder};
pub use retry::{execute_with_retry, with_timeout, BackoffPolicy, RetryPolicy, RetryingEmbedder};
pub use submit::{ArgoSubmitter, SubmissionOutcome, Submitter};
pub use validation::{
    find_back_edge, is_dag, missing_predecessors, validate, validate_or_raise,
    verify_dependencies, DependencyTable, Diagnostic, LintRule, MissingPredecessors, Severity,
};
