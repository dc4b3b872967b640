//! Bounded timeout and retry with configurable backoff for calls to external
//! collaborators (generator, embedder).
//!
//! A retried call is re-issued from scratch; callers must only apply its result
//! once it succeeds so a retry never half-applies a trial.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use intentflow_llm::Embedder;
use intentflow_types::{IntentflowError, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = base.as_millis() as u64 * 2u64.saturating_pow(attempt as u32);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: BackoffPolicy,
    /// Per-attempt deadline; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: BackoffPolicy::default(),
            timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Run `f` with an optional deadline; an elapsed deadline becomes
/// [`IntentflowError::RequestTimeout`].
pub async fn with_timeout<T, Fut>(timeout: Option<Duration>, target: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            IntentflowError::RequestTimeout {
                provider: target.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }
        })?,
    }
}

/// Execute `f` with retry logic.
///
/// The closure is called up to `max_retries + 1` times. Only errors satisfying
/// [`IntentflowError::is_retryable`] are retried (timeouts included); any
/// other error is returned immediately. A rate-limit hint from the provider
/// stretches the backoff delay, never shortens it.
pub async fn execute_with_retry<T, F, Fut>(f: F, policy: &RetryPolicy, target: &str) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match with_timeout(policy.timeout, target, f()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = retry_delay(&policy.backoff, attempt, &e);
                tracing::warn!(
                    target_name = %target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn retry_delay(backoff: &BackoffPolicy, attempt: usize, error: &IntentflowError) -> Duration {
    let delay = backoff.delay_for_attempt(attempt);
    match error {
        IntentflowError::RateLimited { retry_after_ms, .. } => {
            delay.max(Duration::from_millis(*retry_after_ms))
        }
        _ => delay,
    }
}

/// Wraps an [`Embedder`] so each call gets a deadline and retries.
pub struct RetryingEmbedder {
    inner: Arc<dyn Embedder>,
    policy: RetryPolicy,
}

impl RetryingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Embedder for RetryingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        execute_with_retry(|| self.inner.embed(texts), &self.policy, "embedder").await
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }
}
