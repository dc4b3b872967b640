use async_trait::async_trait;
use intentflow_types::IntentflowError;

use crate::{EmbeddingRequest, EmbeddingResponse, Request, Response};

/// Most inputs OpenAI accepts in one embeddings call.
pub const DEFAULT_EMBEDDING_BATCH: usize = 2048;

/// One LLM vendor: chat-style completion plus text embeddings.
///
/// Errors carry the vendor name and are classified retryable or not, so the
/// retry helper can decide without knowing which vendor answered.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn complete(&self, request: &Request) -> Result<Response, IntentflowError>;

    /// Must return exactly one vector per input, in input order.
    async fn embed(&self, request: &EmbeddingRequest)
        -> Result<EmbeddingResponse, IntentflowError>;

    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn default_embedding_model(&self) -> &str;

    /// Largest `input` list a single [`embed`](Self::embed) call accepts.
    fn max_embedding_batch(&self) -> usize {
        DEFAULT_EMBEDDING_BATCH
    }
}
