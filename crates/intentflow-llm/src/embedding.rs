//! Text embeddings and the feature vectors the policy scores.
//!
//! A feature vector is `concat(embed(intent), embed(candidate_text))`. The
//! [`FeatureBuilder`] owns a bounded [`EmbeddingCache`] so repeated texts
//! (the intent on every trial, recurring candidates) are embedded once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use intentflow_types::{IntentflowError, Result};
use moka::sync::Cache;
use xxhash_rust::xxh3::xxh3_64;

use crate::{EmbeddingRequest, LlmClient};

// ---------------------------------------------------------------------------
// Embedder
// ---------------------------------------------------------------------------

/// Maps texts to fixed-length vectors, one per input and in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>>;

    /// Length of every vector this embedder returns.
    fn dim(&self) -> usize;
}

/// Embeddings served by an [`LlmClient`] provider.
pub struct OpenAiEmbedder {
    client: Arc<LlmClient>,
    model: String,
    dim: usize,
}

impl OpenAiEmbedder {
    pub fn new(client: Arc<LlmClient>, model: impl Into<String>, dim: usize) -> Self {
        Self {
            client,
            model: model.into(),
            dim,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
            provider: None,
        };
        let response = self.client.embed(&request).await?;
        for v in &response.vectors {
            if v.len() != self.dim {
                return Err(IntentflowError::DimensionMismatch {
                    expected: self.dim,
                    actual: v.len(),
                });
            }
        }
        Ok(response.vectors)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Deterministic bag-of-tokens embedding for offline runs and tests.
///
/// Each lowercase alphanumeric token is hashed (xxh3) into one of `dim`
/// buckets with a hash-derived sign; the result is L2-normalized. Empty text
/// maps to the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f64> {
        let mut v = vec![0.0; self.dim];
        let lowered = text.to_lowercase();
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = xxh3_64(token.as_bytes());
            let idx = (h % self.dim as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// EmbeddingCache
// ---------------------------------------------------------------------------

/// Bounded memo of embeddings keyed by exact text.
///
/// Backed by `moka` (TinyLFU admission, size-bounded eviction). A capacity of
/// zero disables caching.
pub struct EmbeddingCache {
    capacity: u64,
    cache: Option<Cache<String, Arc<[f64]>>>,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity as u64;
        let cache = (capacity > 0).then(|| Cache::builder().max_capacity(capacity).build());
        Self { capacity, cache }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Entry count after pending evictions have been applied.
    pub fn len(&self) -> u64 {
        match &self.cache {
            Some(cache) => {
                cache.run_pending_tasks();
                cache.entry_count()
            }
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put(&self, key: String, value: Arc<[f64]>) {
        if let Some(cache) = &self.cache {
            cache.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<[f64]>> {
        self.cache.as_ref().and_then(|c| c.get(key))
    }
}

// ---------------------------------------------------------------------------
// FeatureBuilder
// ---------------------------------------------------------------------------

pub struct FeatureBuilder {
    embedder: Arc<dyn Embedder>,
    cache: EmbeddingCache,
}

impl FeatureBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, cache_capacity: usize) -> Self {
        Self {
            embedder,
            cache: EmbeddingCache::new(cache_capacity),
        }
    }

    /// Feature dimension: twice the per-text embedding dimension.
    pub fn dim(&self) -> usize {
        2 * self.embedder.dim()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// `concat(embed(intent), embed(text))`.
    pub async fn features(&mut self, intent: &str, text: &str) -> Result<Vec<f64>> {
        let mut all = self.features_for(intent, &[text]).await?;
        all.pop()
            .ok_or_else(|| IntentflowError::Other("no feature vector produced".into()))
    }

    /// Feature vectors for several candidate texts under one intent, with a
    /// single embedder call for everything not already cached.
    pub async fn features_for(&mut self, intent: &str, texts: &[&str]) -> Result<Vec<Vec<f64>>> {
        let mut wanted: Vec<&str> = Vec::with_capacity(texts.len() + 1);
        wanted.push(intent);
        wanted.extend_from_slice(texts);
        let vectors = self.embed_texts(&wanted).await?;

        let (intent_vec, text_vecs) = vectors
            .split_first()
            .ok_or_else(|| IntentflowError::Other("no intent embedding produced".into()))?;
        Ok(text_vecs
            .iter()
            .map(|tv| {
                let mut phi = Vec::with_capacity(intent_vec.len() + tv.len());
                phi.extend_from_slice(intent_vec);
                phi.extend_from_slice(tv);
                phi
            })
            .collect())
    }

    async fn embed_texts(&mut self, texts: &[&str]) -> Result<Vec<Vec<f64>>> {
        let mut resolved: HashMap<String, Vec<f64>> = HashMap::new();
        let mut misses: Vec<String> = Vec::new();
        for &t in texts {
            if resolved.contains_key(t) || misses.iter().any(|m| m == t) {
                continue;
            }
            match self.cache.get(t) {
                Some(v) => {
                    resolved.insert(t.to_string(), v.to_vec());
                }
                None => misses.push(t.to_string()),
            }
        }

        if !misses.is_empty() {
            tracing::debug!(
                misses = misses.len(),
                cached = resolved.len(),
                "Embedding uncached texts"
            );
            let vectors = self.embedder.embed(&misses).await?;
            if vectors.len() != misses.len() {
                return Err(IntentflowError::Other(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    misses.len()
                )));
            }
            let dim = self.embedder.dim();
            for (text, v) in misses.into_iter().zip(vectors) {
                if v.len() != dim {
                    return Err(IntentflowError::DimensionMismatch {
                        expected: dim,
                        actual: v.len(),
                    });
                }
                self.cache.put(text.clone(), Arc::from(v.as_slice()));
                resolved.insert(text, v);
            }
        }

        texts
            .iter()
            .map(|t| {
                resolved
                    .get(*t)
                    .cloned()
                    .ok_or_else(|| IntentflowError::Other(format!("missing embedding for '{t}'")))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts how many texts reach the embedder.
    struct CountingEmbedder {
        inner: HashingEmbedder,
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
            self.seen.fetch_add(texts.len(), Ordering::Relaxed);
            self.inner.embed(texts).await
        }

        fn dim(&self) -> usize {
            self.inner.dim()
        }
    }

    struct WrongDim;

    #[async_trait]
    impl Embedder for WrongDim {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f64>>> {
            Ok(texts.iter().map(|_| vec![0.0; 3]).collect())
        }

        fn dim(&self) -> usize {
            4
        }
    }

    #[test]
    fn hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(16);
        let a = e.embed_one("1. UE-Monitor\n2. YOLO");
        let b = e.embed_one("1. UE-Monitor\n2. YOLO");
        assert_eq!(a, b);
        let norm: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-12);
        assert!(e.embed_one("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn hashing_embedder_ignores_case() {
        let e = HashingEmbedder::new(32);
        assert_eq!(e.embed_one("YOLO detector"), e.embed_one("yolo DETECTOR"));
    }

    #[test]
    fn cache_stays_within_capacity() {
        let cache = EmbeddingCache::new(2);
        cache.put("a".into(), Arc::from(vec![1.0]));
        assert_eq!(cache.get("a").as_deref(), Some(&[1.0][..]));

        for key in ["b", "c", "d", "e"] {
            cache.put(key.into(), Arc::from(vec![0.0]));
        }
        assert!(cache.len() <= 2);
        assert_eq!(cache.capacity(), 2);
    }

    #[test]
    fn zero_capacity_cache_stores_nothing() {
        let cache = EmbeddingCache::new(0);
        cache.put("a".into(), Arc::from(vec![1.0]));
        assert!(cache.is_empty());
        assert!(cache.get("a").is_none());
    }

    #[tokio::test]
    async fn features_concatenate_intent_and_text() {
        let embedder = Arc::new(HashingEmbedder::new(8));
        let mut fb = FeatureBuilder::new(embedder.clone(), 16);
        let phi = fb.features("detect objects", "1. YOLO").await.unwrap();

        assert_eq!(fb.dim(), 16);
        assert_eq!(phi.len(), 16);
        assert_eq!(&phi[..8], embedder.embed_one("detect objects").as_slice());
        assert_eq!(&phi[8..], embedder.embed_one("1. YOLO").as_slice());
    }

    #[tokio::test]
    async fn repeated_texts_hit_the_cache() {
        let seen = Arc::new(AtomicUsize::new(0));
        let embedder = Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(8),
            seen: seen.clone(),
        });
        let mut fb = FeatureBuilder::new(embedder, 16);

        let feats = fb
            .features_for("intent", &["a", "b", "a"])
            .await
            .unwrap();
        assert_eq!(feats.len(), 3);
        assert_eq!(feats[0], feats[2]);
        assert_eq!(seen.load(Ordering::Relaxed), 3);

        fb.features("intent", "b").await.unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn batch_larger_than_cache_still_resolves() {
        let mut fb = FeatureBuilder::new(Arc::new(HashingEmbedder::new(4)), 1);
        let feats = fb
            .features_for("intent", &["a", "b", "c"])
            .await
            .unwrap();
        assert_eq!(feats.len(), 3);
        assert!(fb.cache().len() <= 1);
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let mut fb = FeatureBuilder::new(Arc::new(WrongDim), 8);
        let err = fb.features("intent", "text").await.unwrap_err();
        assert!(matches!(
            err,
            IntentflowError::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
    }
}
