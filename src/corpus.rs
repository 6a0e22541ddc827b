//! Corpus loading and index construction.
//!
//! A corpus file is a JSON array of chunks:
//!
//! ```json
//! [{ "id": "c1", "content": "...", "metadata": { "doc_type": "person", "page": 3 } }]
//! ```
//!
//! [`index_corpus`] fits the fusion engine over the chunks. When an embedder
//! is configured every chunk is embedded into an in-memory vector index; if
//! that fails the corpus is still indexed for BM25 and searches use the
//! sparse fallback.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use adaptive_rag_core::dense::{DenseIndexAdapter, Embedder, InMemoryVectorIndex};
use adaptive_rag_core::fusion::{HybridFusionEngine, IndexedCorpus};
use adaptive_rag_core::models::Chunk;

/// Read chunks from `path`. Later duplicates of an id are dropped.
pub fn load_chunks(path: &Path) -> Result<Vec<Chunk>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;
    let chunks: Vec<Chunk> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse corpus file: {}", path.display()))?;
    Ok(dedup_chunks(chunks))
}

fn dedup_chunks(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut seen = HashSet::new();
    let total = chunks.len();
    let unique: Vec<Chunk> = chunks
        .into_iter()
        .filter(|c| seen.insert(c.id.clone()))
        .collect();
    if unique.len() < total {
        warn!(dropped = total - unique.len(), "Duplicate chunk ids in corpus");
    }
    unique
}

/// Embed `chunks` into a brute-force vector index.
pub async fn build_dense(
    embedder: Arc<dyn Embedder>,
    chunks: &[Chunk],
    batch_size: usize,
) -> Result<DenseIndexAdapter> {
    let index = InMemoryVectorIndex::build(embedder.as_ref(), chunks, batch_size).await?;
    Ok(DenseIndexAdapter::new(
        embedder,
        Arc::new(index),
        chunks.iter().map(|c| c.id.clone()),
    ))
}

/// Fit `engine` over `chunks`, with a dense index when `embedder` is given
/// and embedding succeeds.
pub async fn index_corpus(
    engine: &HybridFusionEngine,
    chunks: Vec<Chunk>,
    embedder: Option<Arc<dyn Embedder>>,
    batch_size: usize,
) -> Arc<IndexedCorpus> {
    let dense = match embedder {
        Some(embedder) => match build_dense(embedder, &chunks, batch_size).await {
            Ok(dense) => Some(dense),
            Err(e) => {
                warn!(error = %e, "Embedding corpus failed, indexing for BM25 only");
                None
            }
        },
        None => None,
    };
    let corpus = engine.fit(chunks, dense);
    info!(chunks = corpus.len(), "Corpus ready");
    corpus
}

#[cfg(test)]
mod tests {
    use super::*;
    use adaptive_rag_core::fusion::FusionConfig;
    use adaptive_rag_core::sparse::Bm25Params;

    #[test]
    fn test_load_chunks_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "a", "content": "Alpha", "metadata": {"doc_type": "person", "page": 2}},
                {"id": "b", "content": "Beta"},
                {"id": "a", "content": "Alpha again"}
            ]"#,
        )
        .unwrap();

        let chunks = load_chunks(&path).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "Alpha");
        assert_eq!(chunks[0].metadata.len(), 2);
        assert!(chunks[1].metadata.is_empty());
    }

    #[test]
    fn test_load_chunks_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_chunks(&dir.path().join("missing.json")).is_err());
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{").unwrap();
        assert!(load_chunks(&path).is_err());
    }

    #[tokio::test]
    async fn test_index_without_embedder_is_sparse_only() {
        let engine = HybridFusionEngine::new(FusionConfig::default(), Bm25Params::default());
        let corpus = index_corpus(
            &engine,
            vec![Chunk::new("a", "solar panels"), Chunk::new("b", "wind turbines")],
            None,
            8,
        )
        .await;
        assert_eq!(corpus.len(), 2);
        assert!(corpus.dense().is_none());
        assert!(engine.snapshot().is_ok());
    }
}
