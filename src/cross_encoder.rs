//! Cross-encoder rescoring providers.
//!
//! [`HttpCrossEncoder`] talks to an OpenAI-compatible `/v1/rerank` endpoint
//! (one request per query with every passage). `LocalCrossEncoder` runs a
//! fastembed reranker in-process behind the `local-models` feature. Both
//! return sigmoid-normalized scores aligned with the input passages, which is
//! the scale `rerank_threshold` is expressed in.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use adaptive_rag_core::rerank::CrossEncoder;
use adaptive_rag_core::RetrievalError;

use crate::config::RerankerConfig;

/// Maps raw logits to 0-1.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRaw>,
}

#[derive(Deserialize)]
struct RerankResultRaw {
    index: usize,
    relevance_score: f64,
}

/// Scatter `(index, raw score)` pairs back into passage order.
/// Passages the service left out score 0.
fn align_scores(results: impl IntoIterator<Item = (usize, f64)>, count: usize) -> Result<Vec<f64>> {
    let mut scores = vec![0.0; count];
    for (index, raw) in results {
        let Some(slot) = scores.get_mut(index) else {
            bail!("Reranker returned index {} for {} documents", index, count);
        };
        *slot = sigmoid(raw);
    }
    Ok(scores)
}

pub struct HttpCrossEncoder {
    url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpCrossEncoder {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .context("reranker.base_url required for http provider")?;
        Ok(Self {
            url: format!("{}/v1/rerank", base_url.trim_end_matches('/')),
            model: config.model.clone().unwrap_or_else(|| "default".to_string()),
            client: crate::http::client(config.timeout_secs)?,
        })
    }

    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<f64>> {
        let body = RerankRequest {
            model: &self.model,
            query,
            documents: passages,
            top_n: passages.len(),
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("Failed to reach reranker endpoint")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Reranker returned {status}: {body}");
        }

        let body: RerankResponse = resp
            .json()
            .await
            .context("Failed to parse reranker response")?;

        align_scores(
            body.results.into_iter().map(|r| (r.index, r.relevance_score)),
            passages.len(),
        )
    }
}

#[async_trait]
impl CrossEncoder for HttpCrossEncoder {
    fn name(&self) -> &str {
        &self.model
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RetrievalError> {
        debug!(passages = passages.len(), url = %self.url, "Cross-encoder request");
        self.rerank(query, passages)
            .await
            .map_err(|e| RetrievalError::provider("reranker", format!("{:#}", e)))
    }
}

/// fastembed reranker (BGE reranker base by default).
#[cfg(feature = "local-models")]
pub struct LocalCrossEncoder {
    engine: Arc<tokio::sync::Mutex<fastembed::TextRerank>>,
}

#[cfg(feature = "local-models")]
impl LocalCrossEncoder {
    pub async fn new() -> Result<Self> {
        let model = tokio::task::spawn_blocking(|| {
            fastembed::TextRerank::try_new(fastembed::RerankInitOptions::default())
                .map_err(|e| anyhow::anyhow!("Failed to initialize local reranker: {}", e))
        })
        .await??;
        Ok(Self {
            engine: Arc::new(tokio::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-models")]
#[async_trait]
impl CrossEncoder for LocalCrossEncoder {
    fn name(&self) -> &str {
        "fastembed-rerank"
    }

    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, RetrievalError> {
        let mut guard = self.engine.lock().await;
        let results = guard
            .rerank(query.to_owned(), passages.to_vec(), false, None)
            .map_err(|e| RetrievalError::provider("local-reranker", e))?;
        align_scores(
            results.into_iter().map(|r| (r.index, r.score as f64)),
            passages.len(),
        )
        .map_err(|e| RetrievalError::provider("local-reranker", e))
    }
}

/// Build the configured cross-encoder; `None` when disabled.
pub async fn create_cross_encoder(config: &RerankerConfig) -> Result<Option<Arc<dyn CrossEncoder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "http" => Ok(Some(Arc::new(HttpCrossEncoder::new(config)?))),
        #[cfg(feature = "local-models")]
        "local" => Ok(Some(Arc::new(LocalCrossEncoder::new().await?))),
        #[cfg(not(feature = "local-models"))]
        "local" => bail!("Local reranker requires --features local-models"),
        other => bail!("Unknown reranker provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
        assert!((sigmoid(2.5) + sigmoid(-2.5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_align_scores_restores_order() {
        let scores = align_scores(vec![(2, 0.0), (0, 10.0)], 3).unwrap();
        assert!(scores[0] > 0.999);
        assert_eq!(scores[1], 0.0);
        assert!((scores[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_align_scores_rejects_bad_index() {
        assert!(align_scores(vec![(5, 1.0)], 2).is_err());
    }

    #[test]
    fn test_response_shape() {
        let body: RerankResponse = serde_json::from_str(
            r#"{"results":[{"index":1,"relevance_score":-1.5},{"index":0,"relevance_score":3.0}]}"#,
        )
        .unwrap();
        assert_eq!(body.results.len(), 2);
        assert_eq!(body.results[0].index, 1);
    }

    #[tokio::test]
    async fn test_http_requires_base_url() {
        let config = RerankerConfig {
            provider: "http".into(),
            ..Default::default()
        };
        assert!(create_cross_encoder(&config).await.is_err());
        assert!(create_cross_encoder(&RerankerConfig::default()).await.unwrap().is_none());
    }
}
