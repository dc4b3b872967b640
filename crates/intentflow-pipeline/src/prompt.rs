//! Prompt assembly and the LLM-backed candidate generator.

use std::sync::Arc;

use async_trait::async_trait;
use intentflow_llm::{CandidateGenerator, LlmClient, Message, Request};
use intentflow_plan::ModuleCatalog;
use intentflow_types::Result;

use crate::ledger::FeedbackCorpus;
use crate::retry::{execute_with_retry, RetryPolicy};

/// Builds the system prompt: intents, module library, output rules and the
/// rules for reading feedback documents.
pub struct PromptBuilder {
    catalog: Arc<ModuleCatalog>,
    candidates: usize,
}

impl PromptBuilder {
    pub fn new(catalog: Arc<ModuleCatalog>, candidates: usize) -> Self {
        Self {
            catalog,
            candidates,
        }
    }

    pub fn system_prompt(&self) -> String {
        let intents: Vec<&str> = self.catalog.intents().collect();
        let mut out = String::from("You are a network-service composition assistant.\n\n");

        out.push_str(&format!("## Available Intents ({})\n", intents.len()));
        for intent in &intents {
            out.push_str(&format!("- {intent}\n"));
        }

        out.push_str("\n## Module Library\n");
        for module in self.catalog.modules() {
            out.push_str(&format!("- **{}**: {}\n", module.name, module.description));
        }

        out.push_str("\n## Output Format Rules\n");
        out.push_str(&output_rules(self.candidates));

        out.push_str("\n\n## How to use feedback documents\n");
        out.push_str("Pipelines labelled **Perfect**, keep exactly that pipeline for the same intent.\n");
        out.push_str("**Partial**, try to remove unnecessary modules but keep the core order.\n");
        out.push_str("**Bad**, never propose that module combination again for this intent.\n");
        out
    }

    /// System prompt followed by the feedback context, documents separated by a
    /// blank line.
    pub fn with_context(&self, context: &[String]) -> String {
        let mut out = self.system_prompt();
        out.push('\n');
        out.push_str(&context.join("\n\n"));
        out
    }
}

fn output_rules(k: usize) -> String {
    format!(
        "When you answer **generate exactly {k} candidate DAGs** for the given intent.\n\
         • Use numbered lines only. Example:\n  \
         Candidate-1:\n    \
         1. UE-Monitor\n    \
         2. YOLO\n  \
         Candidate-2 (with parallel step):\n    \
         1. Wireless-Monitor\n    \
         2.1 LSTM-Predictor\n    \
         2.2 Semantic-Codec\n\
         • Do NOT add any explanation or extra text.\n"
    )
}

/// Asks an LLM for one round of candidates, feeding back recent feedback
/// documents for the intent.
pub struct LlmGenerator {
    client: Arc<LlmClient>,
    model: String,
    prompt: PromptBuilder,
    corpus: Arc<dyn FeedbackCorpus>,
    context_docs: usize,
    retry: RetryPolicy,
}

impl LlmGenerator {
    pub fn new(
        client: Arc<LlmClient>,
        model: impl Into<String>,
        prompt: PromptBuilder,
        corpus: Arc<dyn FeedbackCorpus>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            prompt,
            corpus,
            context_docs: 50,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_context_docs(mut self, limit: usize) -> Self {
        self.context_docs = limit;
        self
    }

    pub fn build_request(&self, intent: &str) -> Result<Request> {
        let context: Vec<String> = self
            .corpus
            .recent_feedback(intent, self.context_docs)?
            .into_iter()
            .map(|d| d.text)
            .collect();
        Ok(Request::new(
            self.model.clone(),
            vec![
                Message::system(self.prompt.with_context(&context)),
                Message::user(intent),
            ],
        ))
    }
}

#[async_trait]
impl CandidateGenerator for LlmGenerator {
    async fn generate(&self, intent: &str) -> Result<String> {
        let request = self.build_request(intent)?;
        let response = execute_with_retry(
            || self.client.complete(&request),
            &self.retry,
            "generator",
        )
        .await?;
        if response.is_truncated() {
            tracing::warn!(intent, "Generator hit its token limit; last candidate may be cut short");
        }
        tracing::debug!(intent, chars = response.text.len(), "Generator answered");
        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CorpusDocument, InMemoryCorpus};
    use intentflow_llm::{
        EmbeddingRequest, EmbeddingResponse, FinishReason, ProviderAdapter, Response, Role, Usage,
    };
    use intentflow_types::{IntentflowError, Verdict};
    use std::sync::Mutex;

    fn catalog() -> Arc<ModuleCatalog> {
        Arc::new(ModuleCatalog::builtin().unwrap())
    }

    #[test]
    fn system_prompt_lists_intents_modules_and_rules() {
        let cat = catalog();
        let prompt = PromptBuilder::new(cat.clone(), 5).system_prompt();
        assert!(prompt.starts_with("You are a network-service composition assistant.\n\n"));
        assert!(prompt.contains(&format!("## Available Intents ({})", cat.intents().count())));
        assert!(prompt.contains("- **YOLO**: "));
        assert!(prompt.contains("**generate exactly 5 candidate DAGs**"));
        assert!(prompt.contains("  Candidate-2 (with parallel step):\n    1. Wireless-Monitor\n"));
        assert!(prompt.ends_with("never propose that module combination again for this intent.\n"));
    }

    struct Capture {
        seen: Arc<Mutex<Vec<Request>>>,
    }

    #[async_trait]
    impl ProviderAdapter for Capture {
        async fn complete(&self, request: &Request) -> std::result::Result<Response, IntentflowError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(Response {
                id: "r".into(),
                text: "Candidate-1:\n1. YOLO".into(),
                usage: Usage::default(),
                model: request.model.clone(),
                finish_reason: FinishReason::EndTurn,
            })
        }

        async fn embed(
            &self,
            _request: &EmbeddingRequest,
        ) -> std::result::Result<EmbeddingResponse, IntentflowError> {
            Err(IntentflowError::Other("unused".into()))
        }

        fn name(&self) -> &str {
            "capture"
        }

        fn default_model(&self) -> &str {
            "m"
        }

        fn default_embedding_model(&self) -> &str {
            "e"
        }
    }

    #[tokio::test]
    async fn generator_sends_feedback_context_and_intent() {
        let corpus = Arc::new(InMemoryCorpus::new());
        corpus
            .add(CorpusDocument::feedback("earlier outcome".into(), "detect", Verdict::bad()))
            .unwrap();
        corpus
            .add(CorpusDocument::feedback("other intent".into(), "other", Verdict::bad()))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut client = LlmClient::new();
        client.register_provider(Capture { seen: seen.clone() });

        let generator = LlmGenerator::new(
            Arc::new(client),
            "gpt-4o",
            PromptBuilder::new(catalog(), 5),
            corpus,
        );
        let text = generator.generate("detect").await.unwrap();
        assert_eq!(text, "Candidate-1:\n1. YOLO");

        let seen = seen.lock().unwrap();
        let req = &seen[0];
        assert_eq!(req.model, "gpt-4o");
        assert_eq!(req.messages[0].role, Role::System);
        assert!(req.messages[0].content.ends_with("\nearlier outcome"));
        assert!(!req.messages[0].content.contains("other intent"));
        assert_eq!(req.messages[1].content, "detect");
    }
}
