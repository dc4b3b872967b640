use std::collections::HashMap;
use std::sync::Arc;

use intentflow_types::IntentflowError;

use crate::{EmbeddingRequest, EmbeddingResponse, ProviderAdapter, Request, Response, Usage};

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Hooks around every provider call. `after_embed` runs once per batch.
pub trait Middleware: Send + Sync {
    fn before(&self, _request: &mut Request) {}
    fn after(&self, _request: &Request, _response: &mut Response) {}
    fn after_embed(&self, _request: &EmbeddingRequest, _response: &EmbeddingResponse) {}
}

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, request: &mut Request) {
        let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
        tracing::info!(model = %request.model, prompt_chars, "Generator request");
    }

    fn after(&self, _request: &Request, response: &mut Response) {
        tracing::info!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            truncated = response.is_truncated(),
            "Generator response"
        );
    }

    fn after_embed(&self, request: &EmbeddingRequest, response: &EmbeddingResponse) {
        tracing::debug!(
            model = %request.model,
            inputs = request.input.len(),
            tokens = response.usage.total_tokens,
            "Embedding batch"
        );
    }
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

pub struct LlmClient {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    /// First registered provider, used when a request names none.
    default_provider: Option<String>,
    middleware: Vec<Box<dyn Middleware>>,
}

impl LlmClient {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            middleware: Vec::new(),
        }
    }

    /// Reads `OPENAI_API_KEY` (and optionally `OPENAI_BASE_URL`).
    pub fn from_env() -> Result<Self, IntentflowError> {
        let mut client = Self::new();
        client.register_provider(crate::OpenAiAdapter::from_env()?);
        Ok(client)
    }

    pub fn register_provider(&mut self, provider: impl ProviderAdapter + 'static) {
        let name = provider.name().to_string();
        self.default_provider.get_or_insert_with(|| name.clone());
        self.providers.insert(name, Arc::new(provider));
    }

    pub fn with_middleware(mut self, m: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(m));
        self
    }

    pub async fn complete(&self, request: &Request) -> Result<Response, IntentflowError> {
        let provider = self.resolve_provider(request.provider.as_deref())?;
        let mut req = request.clone();
        for m in &self.middleware {
            m.before(&mut req);
        }

        let mut resp = provider.complete(&req).await?;
        for m in &self.middleware {
            m.after(&req, &mut resp);
        }
        Ok(resp)
    }

    /// Embeds `request.input`, split into batches the provider accepts. The
    /// vectors come back in input order; usage is summed over batches.
    pub async fn embed(
        &self,
        request: &EmbeddingRequest,
    ) -> Result<EmbeddingResponse, IntentflowError> {
        let provider = self.resolve_provider(request.provider.as_deref())?;
        let batch = provider.max_embedding_batch().max(1);

        let mut vectors = Vec::with_capacity(request.input.len());
        let mut usage = Usage::default();
        let mut model = request.model.clone();

        for chunk in request.input.chunks(batch) {
            let part = EmbeddingRequest {
                model: request.model.clone(),
                input: chunk.to_vec(),
                provider: request.provider.clone(),
            };
            let resp = provider.embed(&part).await?;
            if resp.vectors.len() != chunk.len() {
                return Err(IntentflowError::ProviderError {
                    provider: provider.name().to_string(),
                    status: 200,
                    message: format!(
                        "expected {} embeddings, got {}",
                        chunk.len(),
                        resp.vectors.len()
                    ),
                    retryable: false,
                });
            }
            for m in &self.middleware {
                m.after_embed(&part, &resp);
            }
            usage += resp.usage;
            if !resp.model.is_empty() {
                model = resp.model;
            }
            vectors.extend(resp.vectors);
        }

        Ok(EmbeddingResponse {
            model,
            vectors,
            usage,
        })
    }

    /// Model used when a caller does not pick one.
    pub fn default_model(&self) -> Option<&str> {
        self.resolve_provider(None).ok().map(|p| p.default_model())
    }

    pub fn default_embedding_model(&self) -> Option<&str> {
        self.resolve_provider(None)
            .ok()
            .map(|p| p.default_embedding_model())
    }

    fn resolve_provider(&self, name: Option<&str>) -> Result<&Arc<dyn ProviderAdapter>, IntentflowError> {
        let Some(name) = name.or(self.default_provider.as_deref()) else {
            return Err(IntentflowError::Other("No providers registered".to_string()));
        };
        self.providers
            .get(name)
            .ok_or_else(|| IntentflowError::Other(format!("Provider '{name}' not registered")))
    }
}

impl Default for LlmClient {
    fn default() -> Self {
        Self::new()
    }
}
