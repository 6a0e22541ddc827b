//! Embedding providers behind the core [`Embedder`] trait.
//!
//! | `embedding.provider` | Implementation |
//! |----------------------|----------------|
//! | `"disabled"` | none; retrieval runs BM25-only |
//! | `"openai"` | [`OpenAiEmbedder`], `POST https://api.openai.com/v1/embeddings` |
//! | `"ollama"` | [`OllamaEmbedder`], `POST {url}/api/embed` |
//! | `"local"` | `LocalEmbedder` (fastembed, `local-models` feature) |
//!
//! HTTP providers batch by `batch_size` and retry per [`crate::http`].
//! Any failure surfaces as `ProviderUnavailable`, which the fusion engine
//! turns into the sparse fallback.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::debug;

use adaptive_rag_core::dense::Embedder;
use adaptive_rag_core::RetrievalError;

use crate::config::EmbeddingConfig;
use crate::http;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Extract `data[].embedding`, ordered by `index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

fn check_count(got: usize, expected: usize) -> Result<()> {
    if got != expected {
        bail!("Embedding count mismatch: sent {} texts, got {} vectors", expected, got);
    }
    Ok(())
}

// ============ OpenAI ============

pub struct OpenAiEmbedder {
    model: String,
    api_key: String,
    client: reqwest::Client,
    batch_size: usize,
    max_retries: u32,
}

impl OpenAiEmbedder {
    /// Requires `embedding.model` and the `OPENAI_API_KEY` environment variable.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            model,
            api_key,
            client: http::client(config.timeout_secs)?,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    async fn embed_batches(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = http::post_json(
                &self.client,
                OPENAI_EMBEDDINGS_URL,
                Some(&self.api_key),
                &body,
                self.max_retries,
                "OpenAI API",
            )
            .await?;
            let vectors = parse_openai_response(&json)?;
            check_count(vectors.len(), batch.len())?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        debug!(count = texts.len(), model = %self.model, "Embedding via OpenAI");
        self.embed_batches(texts)
            .await
            .map_err(|e| RetrievalError::provider("openai", format!("{:#}", e)))
    }
}

// ============ Ollama ============

/// Requires Ollama running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    model: String,
    url: String,
    client: reqwest::Client,
    batch_size: usize,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());

        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            client: http::client(config.timeout_secs)?,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })
    }

    async fn embed_batches(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/api/embed", self.url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = http::post_json(
                &self.client,
                &endpoint,
                None,
                &body,
                self.max_retries,
                "Ollama API",
            )
            .await?;
            let vectors = parse_ollama_response(&json)?;
            check_count(vectors.len(), batch.len())?;
            out.extend(vectors);
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        debug!(count = texts.len(), model = %self.model, "Embedding via Ollama");
        self.embed_batches(texts)
            .await
            .map_err(|e| RetrievalError::provider("ollama", format!("{:#}", e)))
    }
}

// ============ Local (fastembed) ============

/// In-process embedding model. Downloaded from Hugging Face on first use
/// and cached; runs offline afterwards.
#[cfg(feature = "local-models")]
pub struct LocalEmbedder {
    model_name: String,
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-models")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-models")]
impl LocalEmbedder {
    pub async fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let fastembed_model = config_to_fastembed_model(&model_name)?;

        let model = tokio::task::spawn_blocking(move || {
            fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed_model).with_show_download_progress(true),
            )
            .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))
        })
        .await??;

        Ok(Self {
            model_name,
            batch_size: config.batch_size.max(1),
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-models")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut guard = model.lock().unwrap_or_else(|p| p.into_inner());
            guard
                .embed(texts, Some(batch_size))
                .map_err(|e| RetrievalError::provider("local", e))
        })
        .await
        .map_err(|e| RetrievalError::provider("local", e))?
    }
}

/// Build the configured embedder; `None` when embeddings are disabled.
pub async fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiEmbedder::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaEmbedder::new(config)?))),
        #[cfg(feature = "local-models")]
        "local" => Ok(Some(Arc::new(LocalEmbedder::new(config).await?))),
        #[cfg(not(feature = "local-models"))]
        "local" => bail!("Local embedding provider requires --features local-models"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.5, 0.5] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_parse_openai_response_missing_data() {
        let json = serde_json::json!({ "error": "bad" });
        assert!(parse_openai_response(&json).is_err());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] });
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);

        let bad = serde_json::json!({ "embeddings": ["nope"] });
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_is_none() {
        let config = EmbeddingConfig::default();
        assert!(create_embedder(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_provider_errors() {
        let config = EmbeddingConfig {
            provider: "mystery".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_ollama_requires_model() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).await.is_err());
    }
}
