//! Deadline wrappers for external providers.
//!
//! Each wrapper forwards to the inner provider under `tokio::time::timeout`.
//! An elapsed deadline becomes `ProviderUnavailable`, so callers degrade the
//! same way they do for any other provider failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use adaptive_rag_core::dense::Embedder;
use adaptive_rag_core::judge::LanguageModel;
use adaptive_rag_core::rerank::CrossEncoder;
use adaptive_rag_core::{Result, RetrievalError};

async fn with_deadline<T>(
    provider: &str,
    limit: Duration,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(provider, timeout_ms = limit.as_millis() as u64, "Provider call timed out");
            Err(RetrievalError::provider(
                provider,
                format!("timed out after {}ms", limit.as_millis()),
            ))
        }
    }
}

pub struct TimeoutEmbedder {
    inner: Arc<dyn Embedder>,
    limit: Duration,
}

impl TimeoutEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl Embedder for TimeoutEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        with_deadline(self.inner.model_name(), self.limit, self.inner.embed(texts)).await
    }
}

pub struct TimeoutCrossEncoder {
    inner: Arc<dyn CrossEncoder>,
    limit: Duration,
}

impl TimeoutCrossEncoder {
    pub fn new(inner: Arc<dyn CrossEncoder>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl CrossEncoder for TimeoutCrossEncoder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        with_deadline(self.inner.name(), self.limit, self.inner.score(query, passages)).await
    }
}

pub struct TimeoutLanguageModel {
    inner: Arc<dyn LanguageModel>,
    limit: Duration,
}

impl TimeoutLanguageModel {
    pub fn new(inner: Arc<dyn LanguageModel>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl LanguageModel for TimeoutLanguageModel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        with_deadline(self.inner.name(), self.limit, self.inner.generate(prompt)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowModel(Duration);

    #[async_trait]
    impl LanguageModel for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _prompt: &str) -> Result<String> {
            tokio::time::sleep(self.0).await;
            Ok("done".to_string())
        }
    }

    #[tokio::test]
    async fn test_slow_call_becomes_provider_error() {
        let model = TimeoutLanguageModel::new(
            Arc::new(SlowModel(Duration::from_secs(10))),
            Duration::from_millis(20),
        );
        let err = model.generate("hi").await.unwrap_err();
        assert!(matches!(err, RetrievalError::ProviderUnavailable { ref provider, .. } if provider == "slow"));
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let model = TimeoutLanguageModel::new(
            Arc::new(SlowModel(Duration::from_millis(10))),
            Duration::from_secs(1),
        );
        assert_eq!(model.generate("hi").await.unwrap(), "done");
    }

    struct StaticEncoder;

    #[async_trait]
    impl CrossEncoder for StaticEncoder {
        fn name(&self) -> &str {
            "static"
        }

        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f64>> {
            Ok(vec![0.5; passages.len()])
        }
    }

    #[tokio::test]
    async fn test_encoder_wrapper_keeps_name_and_scores() {
        let encoder = TimeoutCrossEncoder::new(Arc::new(StaticEncoder), Duration::from_secs(1));
        assert_eq!(encoder.name(), "static");
        let scores = encoder.score("q", &["a".into(), "b".into()]).await.unwrap();
        assert_eq!(scores, vec![0.5, 0.5]);
    }
}
