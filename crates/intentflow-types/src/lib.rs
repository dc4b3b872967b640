//! Shared types and errors for the intentflow selection loop.
//!
//! This crate provides the foundational types used across all other intentflow crates:
//! - `IntentflowError`: unified error taxonomy
//! - `Label` / `TrialResult`: the outcome of scoring one candidate
//! - `RunRecord`: one line of the durable run-metrics log

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unified error type for all intentflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum IntentflowError {
    // === Generator / Provider Errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    ProviderError {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthError { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout {
        provider: String,
        timeout_ms: u64,
    },

    // === Catalog / Manifest Errors ===
    #[error("Catalog error: {0}")]
    CatalogError(String),

    #[error("Manifest for module '{module}' is invalid: {message}")]
    ManifestError { module: String, message: String },

    // === Policy Errors ===
    #[error("Feature dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Persisted state at {} is corrupt: {message}", path.display())]
    CorruptState { path: PathBuf, message: String },

    // === Controller Errors ===
    #[error("Unknown intent: '{0}'")]
    UnknownIntent(String),

    #[error("Candidate pool is empty")]
    EmptyPool,

    #[error("Graph validation failed: {0}")]
    ValidationError(String),

    #[error("Workflow submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl IntentflowError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntentflowError::RateLimited { .. }
                | IntentflowError::RequestTimeout { .. }
                | IntentflowError::CommandTimeout { .. }
                | IntentflowError::ProviderError { retryable: true, .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    ///
    /// The round controller aborts the whole run on a terminal error instead of
    /// soft-skipping the trial.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentflowError::AuthError { .. }
                | IntentflowError::CatalogError(_)
                | IntentflowError::UnknownIntent(_)
                | IntentflowError::DimensionMismatch { .. }
        )
    }
}

/// A convenience alias for `Result<T, IntentflowError>`.
pub type Result<T> = std::result::Result<T, IntentflowError>;

// ---------------------------------------------------------------------------
// Label: qualitative verdict attached to a reward
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Bad,
    Partial,
    Perfect,
}

impl Label {
    /// The scalar reward paired with this label.
    pub fn reward(self) -> f64 {
        match self {
            Label::Bad => 0.0,
            Label::Partial => 0.5,
            Label::Perfect => 1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Bad => "bad",
            Label::Partial => "partial",
            Label::Perfect => "perfect",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Verdict / TrialResult
// ---------------------------------------------------------------------------

/// Reward and label produced by scoring a candidate against a requirement spec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub reward: f64,
    pub label: Label,
}

impl Verdict {
    pub fn new(label: Label) -> Self {
        Self {
            reward: label.reward(),
            label,
        }
    }

    pub fn bad() -> Self {
        Self::new(Label::Bad)
    }

    pub fn partial() -> Self {
        Self::new(Label::Partial)
    }

    pub fn perfect() -> Self {
        Self::new(Label::Perfect)
    }

    pub fn is_perfect(&self) -> bool {
        self.label == Label::Perfect
    }
}

/// One scored trial of the round controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    /// 1-based trial index within the intent's loop.
    pub trial: usize,
    pub candidate_id: String,
    pub pipeline_key: String,
    pub verdict: Verdict,
    pub posterior_norm: f64,
}

// ---------------------------------------------------------------------------
// RunRecord: one JSON line of the run-metrics log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub phase: String,
    pub intent: String,
    /// Attempts-to-success; `max_trials + 1` when the loop was exhausted.
    #[serde(rename = "ATS")]
    pub ats: usize,
    pub final_posterior_norm: f64,
    pub success_series: Vec<u8>,
    pub posterior_norm_series: Vec<f64>,
}

impl RunRecord {
    /// Whether the success threshold was reached within `max_trials`.
    pub fn succeeded(&self, max_trials: usize) -> bool {
        self.ats <= max_trials
    }
}
