//! LLM access for intentflow: completions and embeddings behind a provider
//! adapter, plus the two ports the round controller consumes.
//!
//! - `LlmClient` routes requests to registered `ProviderAdapter`s through a
//!   middleware chain (`OpenAiAdapter` is the shipped provider).
//! - `Embedder` / `FeatureBuilder` turn intent and candidate text into
//!   feature vectors, memoized in a bounded `EmbeddingCache`.
//! - `CandidateGenerator` yields raw candidate text; `ReplayGenerator` serves
//!   recorded rounds for offline runs.

mod client;
mod embedding;
mod generator;
mod openai;
mod provider;
mod types;

pub use client::*;
pub use embedding::{Embedder, EmbeddingCache, FeatureBuilder, HashingEmbedder, OpenAiEmbedder};
pub use generator::{CandidateGenerator, ReplayGenerator};
pub use openai::OpenAiAdapter;
pub use provider::*;
pub use types::*;
