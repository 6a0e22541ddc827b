//! Dense retrieval seam: embedding provider, vector index, and the adapter
//! that maps vector-store identifiers onto corpus positions.
//!
//! This crate owns no embedding model. Concrete [`Embedder`]s (OpenAI,
//! Ollama, fastembed) live in the `adaptive-rag` app crate; nearest-neighbour
//! search is reached through [`VectorSearch`]. [`InMemoryVectorIndex`] is a
//! brute-force implementation for small corpora and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, RetrievalError};
use crate::models::Chunk;

/// Text → vector embedding provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;

    /// Embed a batch of texts; one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_one(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RetrievalError::provider(embedder.model_name(), "empty embedding response"))
}

/// Nearest-neighbour search over stored embeddings.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Up to `top_k` `(store id, similarity)` pairs, most similar first.
    async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<(String, f32)>>;
}

/// Dense half of the fusion engine.
///
/// Holds the embedder, the vector index, and the id → corpus index map
/// built when the corpus snapshot was fitted.
pub struct DenseIndexAdapter {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorSearch>,
    positions: HashMap<String, usize>,
}

impl DenseIndexAdapter {
    /// `ids` are the store identifiers in corpus order.
    pub fn new<I, S>(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorSearch>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let positions = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id.into(), i))
            .collect();
        Self {
            embedder,
            index,
            positions,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// `(corpus index, similarity)` pairs for a pre-computed query embedding.
    ///
    /// Identifiers unknown to this corpus are dropped.
    pub async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<(usize, f64)>> {
        let hits = self.index.search(query_embedding, top_k).await?;
        Ok(hits
            .into_iter()
            .filter_map(|(id, sim)| match self.positions.get(&id) {
                Some(&pos) => Some((pos, sim as f64)),
                None => {
                    debug!(id = %id, "Dropping vector hit outside corpus");
                    None
                }
            })
            .collect())
    }

    /// Embed `query` and search.
    pub async fn search_text(&self, query: &str, top_k: usize) -> Result<Vec<(usize, f64)>> {
        let embedding = embed_one(self.embedder.as_ref(), query).await?;
        self.search(&embedding, top_k).await
    }
}

/// Brute-force cosine [`VectorSearch`] over vectors held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryVectorIndex {
    entries: Vec<(String, Vec<f32>)>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, vector: Vec<f32>) {
        self.entries.push((id.into(), vector));
    }

    /// Embed every chunk with `embedder`, in batches of `batch_size`.
    pub async fn build(embedder: &dyn Embedder, chunks: &[Chunk], batch_size: usize) -> Result<Self> {
        let mut index = Self::new();
        for batch in chunks.chunks(batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(RetrievalError::provider(
                    embedder.model_name(),
                    format!("expected {} embeddings, got {}", batch.len(), vectors.len()),
                ));
            }
            for (chunk, vector) in batch.iter().zip(vectors) {
                index.insert(chunk.id.clone(), vector);
            }
        }
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl VectorSearch for InMemoryVectorIndex {
    async fn search(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        let mut scored: Vec<(String, f32)> = self
            .entries
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(query_embedding, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, or a zero-norm vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic embedder for unit tests: one dimension per vocabulary word.

    use super::*;
    use crate::text::tokenize;

    pub struct BagOfWordsEmbedder {
        vocabulary: Vec<&'static str>,
    }

    impl BagOfWordsEmbedder {
        pub fn new(vocabulary: &[&'static str]) -> Self {
            Self {
                vocabulary: vocabulary.to_vec(),
            }
        }
    }

    #[async_trait]
    impl Embedder for BagOfWordsEmbedder {
        fn model_name(&self) -> &str {
            "bag-of-words"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let tokens = tokenize(t);
                    self.vocabulary
                        .iter()
                        .map(|w| tokens.iter().filter(|tok| tok == w).count() as f32)
                        .collect()
                })
                .collect())
        }
    }

    pub struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(RetrievalError::provider("failing", "connection refused"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_adapter_maps_ids_to_positions() {
        let mut index = InMemoryVectorIndex::new();
        index.insert("doc-b", vec![0.0, 1.0]);
        index.insert("doc-a", vec![1.0, 0.0]);
        index.insert("stray", vec![1.0, 0.1]);
        let adapter = DenseIndexAdapter::new(
            Arc::new(BagOfWordsEmbedder::new(&["x", "y"])),
            Arc::new(index),
            ["doc-a", "doc-b"],
        );

        let hits = adapter.search(&[1.0, 0.0], 10).await.unwrap();
        let positions: Vec<usize> = hits.iter().map(|(i, _)| *i).collect();
        assert_eq!(positions, vec![0, 1]);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_search_text_embeds_query() {
        let embedder = Arc::new(BagOfWordsEmbedder::new(&["python", "tesla"]));
        let chunks = vec![
            Chunk::new("c0", "Tesla revenue"),
            Chunk::new("c1", "Python language"),
        ];
        let index = InMemoryVectorIndex::build(embedder.as_ref(), &chunks, 1)
            .await
            .unwrap();
        assert_eq!(index.len(), 2);
        let adapter = DenseIndexAdapter::new(embedder, Arc::new(index), ["c0", "c1"]);
        let hits = adapter.search_text("python tips", 1).await.unwrap();
        assert_eq!(hits, vec![(1, 1.0)]);
    }

    #[tokio::test]
    async fn test_embedder_failure_surfaces_provider_error() {
        let adapter = DenseIndexAdapter::new(
            Arc::new(FailingEmbedder),
            Arc::new(InMemoryVectorIndex::new()),
            Vec::<String>::new(),
        );
        let err = adapter.search_text("q", 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::ProviderUnavailable { .. }));
    }
}
