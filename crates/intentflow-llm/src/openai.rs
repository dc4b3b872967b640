//! OpenAI chat-completions and embeddings over `reqwest`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    EmbeddingRequest, EmbeddingResponse, FinishReason, ProviderAdapter, Request, Response, Usage,
};
use intentflow_types::IntentflowError;

const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug)]
pub struct OpenAiAdapter {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
    chat_model: String,
    embedding_model: String,
}

impl OpenAiAdapter {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }

    /// `OPENAI_API_KEY` is required; `OPENAI_BASE_URL` points at a compatible
    /// gateway when set.
    pub fn from_env() -> Result<Self, IntentflowError> {
        let key = std::env::var("OPENAI_API_KEY").map_err(|_| IntentflowError::AuthError {
            provider: PROVIDER.into(),
        })?;
        let adapter = Self::new(key);
        Ok(match std::env::var("OPENAI_BASE_URL") {
            Ok(url) => adapter.with_base_url(url),
            Err(_) => adapter,
        })
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn chat_body(&self, request: &Request) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let mut body = json!({ "model": request.model, "messages": messages });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        body
    }

    fn parse_chat(&self, body: Value) -> Result<Response, IntentflowError> {
        let choice = body["choices"]
            .get(0)
            .ok_or_else(|| malformed("chat response has no choices".into()))?;
        let text = choice["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let finish_reason = match choice["finish_reason"].as_str() {
            Some("length") => FinishReason::MaxTokens,
            _ => FinishReason::EndTurn,
        };
        Ok(Response {
            id: body["id"].as_str().unwrap_or_default().to_string(),
            text,
            usage: parse_usage(&body["usage"]),
            model: body["model"].as_str().unwrap_or_default().to_string(),
            finish_reason,
        })
    }

    /// Vectors are placed by their `index` field, which OpenAI does not
    /// promise to return in order.
    fn parse_embeddings(&self, body: Value, expected: usize) -> Result<EmbeddingResponse, IntentflowError> {
        let data = body["data"]
            .as_array()
            .ok_or_else(|| malformed("embedding response has no data array".into()))?;

        let mut slots: Vec<Option<Vec<f64>>> = vec![None; expected];
        for (pos, item) in data.iter().enumerate() {
            let index = item["index"].as_u64().map_or(pos, |i| i as usize);
            let vector = item["embedding"]
                .as_array()
                .and_then(|values| values.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>())
                .ok_or_else(|| malformed(format!("embedding {index} is not a numeric array")))?;
            match slots.get_mut(index) {
                Some(slot) => *slot = Some(vector),
                None => return Err(malformed(format!("embedding index {index} out of range"))),
            }
        }

        let vectors = slots
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| malformed(format!("missing embedding {i}"))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EmbeddingResponse {
            model: body["model"].as_str().unwrap_or_default().to_string(),
            vectors,
            usage: parse_usage(&body["usage"]),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, IntentflowError> {
        let transport = |e: reqwest::Error| IntentflowError::ProviderError {
            provider: PROVIDER.into(),
            status: 0,
            message: e.to_string(),
            retryable: true,
        };

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let text = resp.text().await.map_err(transport)?;

        if !status.is_success() {
            return Err(map_error(status.as_u16(), &text, retry_after));
        }
        serde_json::from_str(&text).map_err(|e| IntentflowError::ProviderError {
            provider: PROVIDER.into(),
            status: status.as_u16(),
            message: format!("Failed to parse response JSON: {e}"),
            retryable: false,
        })
    }
}

fn malformed(message: String) -> IntentflowError {
    IntentflowError::ProviderError {
        provider: PROVIDER.into(),
        status: 200,
        message,
        retryable: false,
    }
}

/// Chat and embeddings both report `prompt_tokens`; embeddings omit
/// `completion_tokens`.
fn parse_usage(usage: &Value) -> Usage {
    let input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
    Usage {
        input_tokens,
        output_tokens,
        total_tokens: usage["total_tokens"]
            .as_u64()
            .unwrap_or(input_tokens + output_tokens),
    }
}

/// Maps a non-2xx status onto the error taxonomy. 408, 409 and 5xx are
/// transient; other client errors are not.
fn map_error(status: u16, body: &str, retry_after_secs: Option<f64>) -> IntentflowError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string());

    match status {
        401 | 403 => IntentflowError::AuthError {
            provider: PROVIDER.into(),
        },
        429 => IntentflowError::RateLimited {
            provider: PROVIDER.into(),
            retry_after_ms: retry_after_secs.map_or(1000, |s| (s * 1000.0) as u64),
        },
        _ => IntentflowError::ProviderError {
            provider: PROVIDER.into(),
            status,
            message,
            retryable: matches!(status, 408 | 409 | 500..=599),
        },
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn complete(&self, request: &Request) -> Result<Response, IntentflowError> {
        let body = self.post("/v1/chat/completions", &self.chat_body(request)).await?;
        self.parse_chat(body)
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, IntentflowError> {
        let payload = json!({ "model": request.model, "input": request.input });
        let body = self.post("/v1/embeddings", &payload).await?;
        self.parse_embeddings(body, request.input.len())
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.chat_model
    }

    fn default_embedding_model(&self) -> &str {
        &self.embedding_model
    }
}
